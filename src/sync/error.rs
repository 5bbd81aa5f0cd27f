//! Error types of the synchronizer

use thiserror::Error;

/// Reasons an inbound status payload is dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid status JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Status field '{field}' out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Reasons an outbound command did not reach the client queue.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PublishError {
    #[error("Failed to encode command: {0}")]
    Encode(String),

    #[error("MQTT client rejected publish: {0}")]
    Client(String),
}
