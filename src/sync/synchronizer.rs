//! The single owner of [`DashboardState`].
//!
//! Broker events and operator intents are applied one at a time. Every change goes out
//! through one `watch` update, so views never see half of a status message applied.

use chrono::Local;
use std::collections::{HashMap, VecDeque};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::commands::{
    clamp_frequency, format_frequency, parse_frequency_input, CommandReceipt, CommandRecord,
    Delivery, Intent, OutboundCommand, PublishOutcome,
};
use super::decoder::{Decoded, InboundPolicy, MessageDecoder};
use super::error::PublishError;
use super::model::{DashboardState, LinkPhase, RELAY_COUNT};
use crate::mqtt::config::TopicNames;
use crate::mqtt::message_manager::{BrokerEvent, InboundMessage};

/// Hands encoded commands to the broker client without waiting for the network.
pub trait CommandSink: Send {
    fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Maps client-side publish progress back to command ids.
///
/// The client reports publishes in queue order, so queued ids are matched FIFO against
/// outgoing packets. Once a packet id is known the acknowledgement is matched by id.
#[derive(Debug, Default)]
struct DeliveryTracker {
    queued: VecDeque<u64>,
    in_flight: HashMap<u16, u64>,
}

pub struct Synchronizer<K: CommandSink> {
    sink: K,
    decoder: MessageDecoder,
    topics: TopicNames,
    state: watch::Sender<DashboardState>,
    deliveries: DeliveryTracker,
    next_command_id: u64,
}

impl<K: CommandSink> Synchronizer<K> {
    pub fn new(sink: K, topics: TopicNames, policy: InboundPolicy, log_capacity: usize) -> Self {
        let (state, _) = watch::channel(DashboardState::new(log_capacity));
        Self {
            sink,
            decoder: MessageDecoder::new(topics.clone(), policy),
            topics,
            state,
            deliveries: DeliveryTracker::default(),
            next_command_id: 1,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.state.subscribe()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> DashboardState {
        self.state.borrow().clone()
    }

    pub fn mark_connecting(&self) {
        self.state.send_modify(|state| {
            state.connection.phase = LinkPhase::Connecting;
        });
    }

    pub fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                info!("Broker link up");
                self.state.send_modify(|state| {
                    state.connection.phase = LinkPhase::Connected;
                    state.connection.last_error = None;
                    state.stats.last_activity = Some(Local::now());
                });
            }
            BrokerEvent::Reconnecting => self.state.send_modify(|state| {
                state.connection.phase = LinkPhase::Reconnecting;
                state.mark_link_lost();
            }),
            BrokerEvent::Offline => {
                warn!("Broker link offline");
                self.state.send_modify(|state| {
                    state.connection.phase = LinkPhase::Disconnected;
                    state.mark_link_lost();
                });
            }
            BrokerEvent::Error(error) => self.state.send_modify(|state| {
                state.connection.phase = LinkPhase::Failed;
                state.connection.last_error = Some(error);
                state.mark_link_lost();
            }),
            BrokerEvent::SubscribeFailed(error) => {
                warn!("Subscription failed: {}", error);
                self.state
                    .send_modify(|state| state.connection.last_error = Some(error));
            }
            BrokerEvent::Message(message) => self.handle_message(message),
            BrokerEvent::PublishSent(pkid) => self.handle_publish_sent(pkid),
            BrokerEvent::PublishAcked(pkid) => match self.deliveries.in_flight.remove(&pkid) {
                Some(id) => {
                    debug!("Command #{} acknowledged (packet {})", id, pkid);
                    self.state
                        .send_modify(|state| state.update_delivery(id, Delivery::Acknowledged));
                }
                None => debug!("Acknowledgement for unknown packet {}", pkid),
            },
        }
    }

    fn handle_message(&mut self, message: InboundMessage) {
        let decoded = self.decoder.decode(&message);
        self.state.send_modify(|state| {
            state.stats.messages_received += 1;
            state.stats.last_activity = Some(message.received_at);

            match decoded {
                Ok(Some(Decoded::Status(report))) => report.apply_to(state, message.received_at),
                Ok(Some(Decoded::Log(text))) => state.logs.push(message.received_at, text),
                Ok(None) => {}
                Err(e) => {
                    warn!("Dropping message on {}: {}", message.topic, e);
                    state.stats.decode_failures += 1;
                }
            }
        });
    }

    fn handle_publish_sent(&mut self, pkid: u16) {
        // After a reconnect the client retransmits unacknowledged packets with their old id.
        if pkid != 0 && self.deliveries.in_flight.contains_key(&pkid) {
            debug!("Packet {} retransmitted", pkid);
            return;
        }
        let Some(id) = self.deliveries.queued.pop_front() else {
            debug!("Publish {} sent without a tracked command", pkid);
            return;
        };

        let delivery = if pkid == 0 {
            Delivery::Sent
        } else {
            self.deliveries.in_flight.insert(pkid, id);
            Delivery::InFlight(pkid)
        };
        self.state.send_modify(|state| {
            state.stats.messages_sent += 1;
            state.update_delivery(id, delivery);
        });
    }

    pub fn handle_intent(&mut self, intent: Intent) -> CommandReceipt {
        let id = self.next_command_id;
        self.next_command_id += 1;
        debug!("Handling intent #{}: {}", id, intent);

        let (command, outcome) = match intent {
            Intent::Start => self.send_control(id, OutboundCommand::Start),
            Intent::Stop => self.send_control(id, OutboundCommand::Stop),
            Intent::EmergencyStop => self.send_control(id, OutboundCommand::EmergencyStop),
            Intent::SetFrequency(hz) => self.set_frequency(id, clamp_frequency(hz)),
            Intent::FrequencyInput(text) => self.set_frequency(id, parse_frequency_input(&text)),
            Intent::ToggleRelay(index) => self.toggle_relay(id, index),
        };

        CommandReceipt {
            id,
            command,
            outcome,
        }
    }

    fn send_control(
        &mut self,
        id: u64,
        command: OutboundCommand,
    ) -> (Option<OutboundCommand>, PublishOutcome) {
        let outcome = self.publish(id, &command);
        (Some(command), outcome)
    }

    fn set_frequency(&mut self, id: u64, hz: f64) -> (Option<OutboundCommand>, PublishOutcome) {
        let command = OutboundCommand::SetFrequency(hz);
        let outcome = self.publish(id, &command);
        let published = outcome.is_published();
        self.state.send_modify(|state| {
            state.frequency_setpoint.request(hz, published);
        });
        info!("Frequency setpoint {} Hz", format_frequency(hz));
        (Some(command), outcome)
    }

    fn toggle_relay(&mut self, id: u64, index: usize) -> (Option<OutboundCommand>, PublishOutcome) {
        let (target, allowed) = {
            let state = self.state.borrow();
            match state.relays.channel(index) {
                Some(channel) => (!*channel.desired(), state.can_send_relay_commands()),
                None => {
                    return (
                        None,
                        PublishOutcome::Rejected(format!(
                            "relay index {} out of range (0..{})",
                            index, RELAY_COUNT
                        )),
                    )
                }
            }
        };

        let command = OutboundCommand::SetRelay {
            index,
            state: target,
        };
        let outcome = if allowed {
            self.publish(id, &command)
        } else {
            let reason = "broker or gateway offline".to_string();
            warn!("Not sending {}: {}", command, reason);
            self.record(id, &command, Delivery::Suppressed(reason.clone()));
            PublishOutcome::Suppressed(reason)
        };

        let published = outcome.is_published();
        self.state.send_modify(|state| {
            if let Some(channel) = state.relays.channel_mut(index) {
                channel.request(target, published);
            }
        });
        (Some(command), outcome)
    }

    fn publish(&mut self, id: u64, command: &OutboundCommand) -> PublishOutcome {
        let result = command
            .encode()
            .and_then(|payload| self.sink.enqueue(command.topic(&self.topics), payload));

        match result {
            Ok(()) => {
                info!("Published {} (#{})", command, id);
                self.deliveries.queued.push_back(id);
                self.state
                    .send_modify(|state| state.last_command_at = Some(Local::now()));
                self.record(id, command, Delivery::Queued);
                PublishOutcome::Published
            }
            Err(e) => {
                warn!("Failed to publish {}: {}", command, e);
                self.state
                    .send_modify(|state| state.stats.publish_failures += 1);
                self.record(id, command, Delivery::Failed(e.to_string()));
                PublishOutcome::Failed(e)
            }
        }
    }

    fn record(&self, id: u64, command: &OutboundCommand, delivery: Delivery) {
        self.state.send_modify(|state| {
            state.record_command(CommandRecord {
                id,
                command: command.clone(),
                issued_at: Local::now(),
                delivery,
            })
        });
    }

    /// Puts the connection part of the state back to its initial value after teardown.
    pub fn reset(&mut self) {
        self.deliveries = DeliveryTracker::default();
        self.state.send_modify(|state| {
            state.connection = Default::default();
            state.mark_link_lost();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        fail: Arc<AtomicBool>,
    }

    impl RecordingSink {
        fn payloads(&self) -> Vec<(String, String)> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, payload)| (topic.clone(), String::from_utf8(payload.clone()).unwrap()))
                .collect()
        }
    }

    impl CommandSink for RecordingSink {
        fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PublishError::Client("request channel full".to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn synchronizer() -> (Synchronizer<RecordingSink>, RecordingSink) {
        let sink = RecordingSink::default();
        let sync = Synchronizer::new(sink.clone(), TopicNames::default(), InboundPolicy::Clamp, 100);
        (sync, sink)
    }

    fn status(payload: &str) -> BrokerEvent {
        BrokerEvent::Message(InboundMessage::from_topic("vfd/status", payload))
    }

    #[test]
    fn relay_toggle_is_held_back_until_link_and_gateway_are_up() {
        let (mut sync, sink) = synchronizer();

        let receipt = sync.handle_intent(Intent::ToggleRelay(1));
        assert!(matches!(receipt.outcome, PublishOutcome::Suppressed(_)));
        assert!(sink.payloads().is_empty());
        assert!(*sync.state().relays.channel(1).unwrap().desired());
        assert!(sync.state().connection_warning().is_some());

        sync.handle_event(BrokerEvent::Connected);
        sync.handle_event(status(r#"{"motorState":"Stopped","vfd_responding":true}"#));
        // The unsent toggle is rolled back by the fresh status.
        assert!(!*sync.state().relays.channel(1).unwrap().desired());

        let receipt = sync.handle_intent(Intent::ToggleRelay(1));
        assert!(receipt.outcome.is_published());
        assert_eq!(
            sink.payloads(),
            vec![(
                "vfd/relays".to_string(),
                r#"{"relay_command":"set_state","relay_num":2,"state":true}"#.to_string()
            )]
        );
    }

    #[test]
    fn relay_toggle_is_suppressed_when_gateway_reports_offline() {
        let (mut sync, sink) = synchronizer();
        sync.handle_event(BrokerEvent::Connected);
        sync.handle_event(status(r#"{"esp32_online":false}"#));

        let receipt = sync.handle_intent(Intent::ToggleRelay(0));
        assert!(matches!(receipt.outcome, PublishOutcome::Suppressed(_)));
        assert!(sink.payloads().is_empty());
    }

    #[test]
    fn relay_index_out_of_range_is_rejected() {
        let (mut sync, _) = synchronizer();
        let receipt = sync.handle_intent(Intent::ToggleRelay(RELAY_COUNT));
        assert!(matches!(receipt.outcome, PublishOutcome::Rejected(_)));
        assert_eq!(receipt.command, None);
    }

    #[test]
    fn frequency_input_is_clamped_displayed_and_published() {
        let (mut sync, sink) = synchronizer();
        let receipt = sync.handle_intent(Intent::FrequencyInput("5000".to_string()));

        assert!(receipt.outcome.is_published());
        assert_eq!(receipt.command, Some(OutboundCommand::SetFrequency(60.0)));
        assert_eq!(
            format_frequency(*sync.state().frequency_setpoint.desired()),
            "60.00"
        );
        assert_eq!(
            sink.payloads(),
            vec![(
                "vfd/control".to_string(),
                r#"{"command":"set_frequency","frequency":60}"#.to_string()
            )]
        );
        assert!(sync.state().last_command_at.is_some());
    }

    #[test]
    fn reported_frequency_does_not_override_setpoint() {
        let (mut sync, _) = synchronizer();
        sync.handle_intent(Intent::SetFrequency(45.0));
        sync.handle_event(status(r#"{"frequency":12.5}"#));

        let state = sync.state();
        assert_eq!(*state.frequency_setpoint.desired(), 45.0);
        assert_eq!(*state.frequency_setpoint.confirmed(), 45.0);
        assert_eq!(state.motor.frequency_hz, 12.5);
    }

    #[test]
    fn malformed_status_leaves_fields_unchanged() {
        let (mut sync, _) = synchronizer();
        sync.handle_event(status(
            r#"{"motorState":"Running","frequency":50,"rpm":1450,"current":10.5,"voltage":230,"vfd_responding":true}"#,
        ));
        let before = sync.state();

        sync.handle_event(status(r#"{"motorState":"Stopped","frequency":"#));
        let after = sync.state();

        assert_eq!(after.motor, before.motor);
        assert_eq!(after.telemetry, before.telemetry);
        assert_eq!(after.connectivity, before.connectivity);
        assert_eq!(after.stats.decode_failures, 1);
    }

    #[test]
    fn log_messages_are_kept_in_order() {
        let (mut sync, _) = synchronizer();
        for i in 0..5 {
            sync.handle_event(BrokerEvent::Message(InboundMessage::from_topic(
                "vfd/logs",
                format!("boot step {}", i),
            )));
        }

        let state = sync.state();
        let messages: Vec<&str> = state.logs.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["boot step 0", "boot step 1", "boot step 2", "boot step 3", "boot step 4"]
        );
        let stamps: Vec<_> = state.logs.iter().map(|e| e.timestamp).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn connection_errors_are_surfaced_and_cleared_on_connect() {
        let (mut sync, _) = synchronizer();
        sync.mark_connecting();
        assert_eq!(sync.state().connection.phase, LinkPhase::Connecting);

        sync.handle_event(BrokerEvent::Error("connection refused".to_string()));
        let state = sync.state();
        assert_eq!(state.connection.phase, LinkPhase::Failed);
        assert_eq!(state.connection.last_error.as_deref(), Some("connection refused"));

        sync.handle_event(BrokerEvent::Reconnecting);
        sync.handle_event(BrokerEvent::Connected);
        let state = sync.state();
        assert!(state.connection.connected());
        assert_eq!(state.connection.last_error, None);
    }

    #[test]
    fn failed_subscription_is_surfaced_without_dropping_the_link() {
        let (mut sync, _) = synchronizer();
        sync.handle_event(BrokerEvent::Connected);
        sync.handle_event(BrokerEvent::SubscribeFailed(
            "Broker rejected subscription (packet 3)".to_string(),
        ));

        let state = sync.state();
        assert_eq!(state.connection.phase, LinkPhase::Connected);
        assert_eq!(
            state.connection.last_error.as_deref(),
            Some("Broker rejected subscription (packet 3)")
        );
    }

    #[test]
    fn losing_the_link_blocks_relay_commands_again() {
        let (mut sync, _) = synchronizer();
        sync.handle_event(BrokerEvent::Connected);
        sync.handle_event(status("{}"));
        assert!(sync.state().can_send_relay_commands());

        sync.handle_event(BrokerEvent::Offline);
        assert!(!sync.state().can_send_relay_commands());
    }

    #[test]
    fn publish_failure_is_reported_in_receipt() {
        let (mut sync, sink) = synchronizer();
        sink.fail.store(true, Ordering::SeqCst);

        let receipt = sync.handle_intent(Intent::Start);
        assert!(matches!(receipt.outcome, PublishOutcome::Failed(PublishError::Client(_))));
        let state = sync.state();
        assert_eq!(state.stats.publish_failures, 1);
        assert!(state.last_command_at.is_none());
        assert!(matches!(
            state.recent_commands.back().map(|r| &r.delivery),
            Some(Delivery::Failed(_))
        ));
    }

    #[test]
    fn failed_frequency_publish_is_rolled_back_by_status() {
        let (mut sync, sink) = synchronizer();
        sink.fail.store(true, Ordering::SeqCst);
        sync.handle_intent(Intent::SetFrequency(30.0));
        assert_eq!(*sync.state().frequency_setpoint.desired(), 30.0);

        sync.handle_event(status("{}"));
        assert_eq!(*sync.state().frequency_setpoint.desired(), 0.0);
    }

    #[test]
    fn deliveries_follow_sent_and_acked_packets() {
        let (mut sync, _) = synchronizer();
        let first = sync.handle_intent(Intent::Start);
        let second = sync.handle_intent(Intent::Stop);

        sync.handle_event(BrokerEvent::PublishSent(7));
        sync.handle_event(BrokerEvent::PublishSent(8));
        // Retransmission after reconnect must not consume another command.
        sync.handle_event(BrokerEvent::PublishSent(7));
        sync.handle_event(BrokerEvent::PublishAcked(7));

        let state = sync.state();
        let delivery = |id: u64| {
            state
                .recent_commands
                .iter()
                .find(|r| r.id == id)
                .map(|r| r.delivery.clone())
        };
        assert_eq!(delivery(first.id), Some(Delivery::Acknowledged));
        assert_eq!(delivery(second.id), Some(Delivery::InFlight(8)));
        assert_eq!(state.stats.messages_sent, 2);
    }

    #[test]
    fn reset_returns_connection_to_initial_state() {
        let (mut sync, _) = synchronizer();
        sync.handle_event(BrokerEvent::Connected);
        sync.handle_event(status("{}"));
        sync.reset();

        let state = sync.state();
        assert_eq!(state.connection.phase, LinkPhase::Disconnected);
        assert!(!state.connectivity.gateway_up);
    }

    #[tokio::test]
    async fn subscribers_observe_status_updates() {
        let (mut sync, _) = synchronizer();
        let mut rx = sync.subscribe();

        sync.handle_event(status(r#"{"motorState":"Running"}"#));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().motor.state.to_string(), "Running");
    }
}
