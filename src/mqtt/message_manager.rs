use chrono::{DateTime, Local};
use std::fmt;

use super::config::TopicNames;

/// Topics the client cares about, resolved from their configured names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Status,
    Logs,
    Control,
    Relays,
}

impl Topic {
    pub fn name(self, names: &TopicNames) -> &str {
        match self {
            Topic::Status => &names.status,
            Topic::Logs => &names.logs,
            Topic::Control => &names.control,
            Topic::Relays => &names.relays,
        }
    }

    /// Maps an incoming topic string back to a known topic. Only exact matches count.
    pub fn classify(topic: &str, names: &TopicNames) -> Option<Topic> {
        [Topic::Status, Topic::Logs, Topic::Control, Topic::Relays]
            .into_iter()
            .find(|candidate| candidate.name(names) == topic)
    }
}

/// One message as delivered by the broker, stamped with local receipt time.
#[derive(Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.text();
        let preview: String = text.chars().take(48).collect();
        write!(
            f,
            "{} - {} ({} bytes): {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload.len(),
            preview
        )
    }
}

/// Raw broker-side events forwarded from the connection task to the synchronizer.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Broker acknowledged the connection and the subscriptions are queued.
    Connected,
    /// A new connection attempt is about to start.
    Reconnecting,
    /// The broker closed the connection or the link went away.
    Offline,
    Error(String),
    /// Subscribing failed or the broker rejected a topic. The link stays up.
    SubscribeFailed(String),
    Message(InboundMessage),
    /// A queued publish left the client with this packet id (0 for QoS 0).
    PublishSent(u16),
    PublishAcked(u16),
}
