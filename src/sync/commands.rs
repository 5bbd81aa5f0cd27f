//! Outbound commands and operator intents.
//!
//! An [`Intent`] is what the operator asked for, an [`OutboundCommand`] is what goes on
//! the wire. Every handled intent yields a [`CommandReceipt`].

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::fmt;

use super::error::PublishError;
use super::model::RELAY_COUNT;
use crate::mqtt::config::TopicNames;

pub const MIN_FREQUENCY_HZ: f64 = 0.0;
pub const MAX_FREQUENCY_HZ: f64 = 60.0;

/// Limits a frequency to the drive's range. NaN becomes the minimum.
pub fn clamp_frequency(value: f64) -> f64 {
    if value.is_nan() {
        return MIN_FREQUENCY_HZ;
    }
    value.clamp(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ)
}

/// Reads the longest numeric prefix of operator input, ignoring leading whitespace.
///
/// `"42.5Hz"` reads as 42.5, `"abc"` and `""` read as 0. The result is clamped.
pub fn parse_frequency_input(input: &str) -> f64 {
    clamp_frequency(numeric_prefix(input.trim_start()).unwrap_or(MIN_FREQUENCY_HZ))
}

fn numeric_prefix(input: &str) -> Option<f64> {
    let bytes = input.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    if input[end..].starts_with("Infinity") {
        return input[..end + "Infinity".len()].parse().ok();
    }

    let int_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    let mut digits = end - int_start;

    if bytes.get(end) == Some(&b'.') {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while bytes.get(frac_end).is_some_and(u8::is_ascii_digit) {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }
    if digits == 0 {
        return None;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while bytes.get(exp_end).is_some_and(u8::is_ascii_digit) {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    input[..end].parse().ok()
}

pub fn format_frequency(value: f64) -> String {
    format!("{:.2}", value)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum OutboundCommand {
    Start,
    Stop,
    EmergencyStop,
    SetFrequency(f64),
    /// Zero-based relay index.
    SetRelay { index: usize, state: bool },
}

#[derive(Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ControlPayload {
    Start,
    Stop,
    EmergencyStop,
    SetFrequency {
        #[serde(serialize_with = "wire_number")]
        frequency: f64,
    },
}

#[derive(Serialize)]
struct RelayPayload {
    relay_command: &'static str,
    relay_num: usize,
    state: bool,
}

/// Integral values go out as JSON integers (`60`, not `60.0`).
fn wire_number<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

impl OutboundCommand {
    pub fn topic<'a>(&self, topics: &'a TopicNames) -> &'a str {
        match self {
            OutboundCommand::SetRelay { .. } => &topics.relays,
            _ => &topics.control,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PublishError> {
        let encoded = match self {
            OutboundCommand::Start => serde_json::to_vec(&ControlPayload::Start),
            OutboundCommand::Stop => serde_json::to_vec(&ControlPayload::Stop),
            OutboundCommand::EmergencyStop => serde_json::to_vec(&ControlPayload::EmergencyStop),
            OutboundCommand::SetFrequency(hz) => serde_json::to_vec(&ControlPayload::SetFrequency {
                frequency: clamp_frequency(*hz),
            }),
            OutboundCommand::SetRelay { index, state } => {
                if *index >= RELAY_COUNT {
                    return Err(PublishError::Encode(format!(
                        "relay index {} out of range",
                        index
                    )));
                }
                serde_json::to_vec(&RelayPayload {
                    relay_command: "set_state",
                    relay_num: index + 1,
                    state: *state,
                })
            }
        };
        encoded.map_err(|e| PublishError::Encode(e.to_string()))
    }
}

impl fmt::Display for OutboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutboundCommand::Start => write!(f, "start"),
            OutboundCommand::Stop => write!(f, "stop"),
            OutboundCommand::EmergencyStop => write!(f, "emergency stop"),
            OutboundCommand::SetFrequency(hz) => write!(f, "set frequency {} Hz", format_frequency(*hz)),
            OutboundCommand::SetRelay { index, state } => write!(
                f,
                "relay {} {}",
                index + 1,
                if *state { "on" } else { "off" }
            ),
        }
    }
}

/// Operator actions forwarded by the views.
#[derive(Clone, Debug, PartialEq)]
pub enum Intent {
    Start,
    Stop,
    EmergencyStop,
    /// Slider value.
    SetFrequency(f64),
    /// Raw text from the frequency input field.
    FrequencyInput(String),
    /// Zero-based relay index.
    ToggleRelay(usize),
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Intent::Start => write!(f, "Start"),
            Intent::Stop => write!(f, "Stop"),
            Intent::EmergencyStop => write!(f, "EmergencyStop"),
            Intent::SetFrequency(hz) => write!(f, "SetFrequency({})", hz),
            Intent::FrequencyInput(text) => write!(f, "FrequencyInput({:?})", text),
            Intent::ToggleRelay(index) => write!(f, "ToggleRelay({})", index),
        }
    }
}

/// Delivery progress of one published command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Delivery {
    /// Handed to the client queue.
    Queued,
    /// Written to the socket with this packet id.
    InFlight(u16),
    /// Written without a packet id, nothing to acknowledge.
    Sent,
    Acknowledged,
    Suppressed(String),
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommandRecord {
    pub id: u64,
    pub command: OutboundCommand,
    pub issued_at: DateTime<Local>,
    pub delivery: Delivery,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PublishOutcome {
    Published,
    /// Not sent because the link is down. Local state was still updated.
    Suppressed(String),
    Failed(PublishError),
    /// The intent itself was invalid, nothing changed.
    Rejected(String),
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommandReceipt {
    pub id: u64,
    pub command: Option<OutboundCommand>,
    pub outcome: PublishOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(command: &OutboundCommand) -> String {
        String::from_utf8(command.encode().unwrap()).unwrap()
    }

    #[test]
    fn clamps_into_drive_range() {
        assert_eq!(clamp_frequency(-5.0), 0.0);
        assert_eq!(clamp_frequency(75.0), 60.0);
        assert_eq!(clamp_frequency(42.5), 42.5);
        assert_eq!(clamp_frequency(f64::NAN), 0.0);
        assert_eq!(clamp_frequency(f64::INFINITY), 60.0);
    }

    #[test]
    fn parses_operator_input_like_a_number_field() {
        assert_eq!(parse_frequency_input("5000"), 60.0);
        assert_eq!(parse_frequency_input("  42.5Hz"), 42.5);
        assert_eq!(parse_frequency_input(".5"), 0.5);
        assert_eq!(parse_frequency_input("1e1"), 10.0);
        assert_eq!(parse_frequency_input("3e"), 3.0);
        assert_eq!(parse_frequency_input("-12"), 0.0);
        assert_eq!(parse_frequency_input("abc"), 0.0);
        assert_eq!(parse_frequency_input(""), 0.0);
        assert_eq!(parse_frequency_input("."), 0.0);
        assert_eq!(parse_frequency_input("Infinity"), 60.0);
    }

    #[test]
    fn oversized_input_is_displayed_and_sent_as_maximum() {
        let hz = parse_frequency_input("5000");
        assert_eq!(format_frequency(hz), "60.00");
        assert_eq!(
            encoded(&OutboundCommand::SetFrequency(hz)),
            r#"{"command":"set_frequency","frequency":60}"#
        );
    }

    #[test]
    fn fractional_frequency_keeps_its_fraction() {
        assert_eq!(
            encoded(&OutboundCommand::SetFrequency(42.5)),
            r#"{"command":"set_frequency","frequency":42.5}"#
        );
    }

    #[test]
    fn control_commands_match_wire_format() {
        assert_eq!(encoded(&OutboundCommand::Start), r#"{"command":"start"}"#);
        assert_eq!(encoded(&OutboundCommand::Stop), r#"{"command":"stop"}"#);
        assert_eq!(
            encoded(&OutboundCommand::EmergencyStop),
            r#"{"command":"emergency_stop"}"#
        );
    }

    #[test]
    fn relay_numbers_are_one_based() {
        let command = OutboundCommand::SetRelay {
            index: 2,
            state: true,
        };
        assert_eq!(
            encoded(&command),
            r#"{"relay_command":"set_state","relay_num":3,"state":true}"#
        );
        let topics = TopicNames::default();
        assert_eq!(command.topic(&topics), "vfd/relays");
        assert_eq!(OutboundCommand::Start.topic(&topics), "vfd/control");
    }

    #[test]
    fn relay_index_out_of_range_fails_to_encode() {
        let command = OutboundCommand::SetRelay {
            index: RELAY_COUNT,
            state: true,
        };
        assert!(matches!(command.encode(), Err(PublishError::Encode(_))));
    }
}
