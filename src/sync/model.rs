//! Observable view state.
//!
//! Everything the views render lives in one [`DashboardState`], owned by the
//! synchronizer and published through a `watch` channel. Views only read it.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

use super::commands::{CommandRecord, Delivery};

pub const RELAY_COUNT: usize = 4;
pub const NO_FAULT: &str = "None";
const COMMAND_HISTORY: usize = 32;

/// Phase of the broker link.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
pub enum LinkPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            LinkPhase::Disconnected => "Disconnected",
            LinkPhase::Connecting => "Connecting",
            LinkPhase::Connected => "Connected",
            LinkPhase::Failed => "Failed",
            LinkPhase::Reconnecting => "Reconnecting",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConnectionState {
    pub phase: LinkPhase,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn connected(&self) -> bool {
        self.phase == LinkPhase::Connected
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum MotorState {
    Stopped,
    Running,
    #[default]
    Unknown,
}

impl MotorState {
    /// Firmware sends free-form strings; anything besides running/stopped is unknown.
    pub fn from_wire(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => MotorState::Running,
            "stopped" => MotorState::Stopped,
            _ => MotorState::Unknown,
        }
    }
}

impl fmt::Display for MotorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            MotorState::Stopped => "Stopped",
            MotorState::Running => "Running",
            MotorState::Unknown => "Unknown",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MotorStatus {
    pub state: MotorState,
    pub frequency_hz: f64,
    pub rpm: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Telemetry {
    pub frequency_hz: f64,
    pub current_amps: f64,
    pub voltage_volts: f64,
    pub fault: String,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            frequency_hz: 0.0,
            current_amps: 0.0,
            voltage_volts: 0.0,
            fault: NO_FAULT.to_string(),
        }
    }
}

impl Telemetry {
    pub fn has_fault(&self) -> bool {
        self.fault != NO_FAULT
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectivitySummary {
    pub gsm_up: bool,
    pub gateway_up: bool,
    pub drive_responding: bool,
}

/// Where a locally requested value stands relative to the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    InSync,
    /// Published, waiting for the next status message.
    Pending,
    /// Applied locally only; no publish happened.
    Unsent,
}

/// A value with a locally desired and a hardware-confirmed side.
///
/// `request` changes the desired side immediately. The next status message either
/// reports the real value (`confirm`) or, lacking one, settles the pair with
/// `resolve`: a published request becomes confirmed, an unsent one is rolled back.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reconciled<T> {
    desired: T,
    confirmed: T,
    published: Option<T>,
}

impl<T: Clone + PartialEq> Reconciled<T> {
    pub fn new(initial: T) -> Self {
        Self {
            desired: initial.clone(),
            confirmed: initial,
            published: None,
        }
    }

    pub fn desired(&self) -> &T {
        &self.desired
    }

    pub fn confirmed(&self) -> &T {
        &self.confirmed
    }

    pub fn phase(&self) -> SyncPhase {
        match &self.published {
            Some(published) if *published == self.desired => SyncPhase::Pending,
            _ if self.desired == self.confirmed && self.published.is_none() => SyncPhase::InSync,
            _ => SyncPhase::Unsent,
        }
    }

    pub fn is_diverged(&self) -> bool {
        self.phase() != SyncPhase::InSync
    }

    pub fn request(&mut self, value: T, published: bool) {
        if published {
            self.published = Some(value.clone());
        }
        self.desired = value;
    }

    pub fn confirm(&mut self, reported: T) {
        self.desired = reported.clone();
        self.confirmed = reported;
        self.published = None;
    }

    pub fn resolve(&mut self) {
        if let Some(published) = self.published.take() {
            self.confirmed = published;
        }
        self.desired = self.confirmed.clone();
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RelayBank {
    channels: [Reconciled<bool>; RELAY_COUNT],
}

impl Default for RelayBank {
    fn default() -> Self {
        Self {
            channels: std::array::from_fn(|_| Reconciled::new(false)),
        }
    }
}

impl RelayBank {
    pub fn channel(&self, index: usize) -> Option<&Reconciled<bool>> {
        self.channels.get(index)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut Reconciled<bool>> {
        self.channels.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reconciled<bool>> {
        self.channels.iter()
    }

    pub fn confirm_all(&mut self, reported: &[bool]) {
        for (channel, state) in self.channels.iter_mut().zip(reported) {
            channel.confirm(*state);
        }
    }

    pub fn resolve_all(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.resolve();
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Position in the stream since session start, unaffected by eviction.
    pub seq: u64,
    pub timestamp: DateTime<Local>,
    pub message: String,
}

/// Ring buffer of device log lines.
#[derive(Clone, Debug, Serialize)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_seq: u64,
    evicted: u64,
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 0,
            evicted: 0,
        }
    }

    pub fn push(&mut self, timestamp: DateTime<Local>, message: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(LogEntry {
            seq: self.next_seq,
            timestamp,
            message,
        });
        self.next_seq += 1;
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Entries with a sequence number of at least `seq`, oldest first.
    pub fn since(&self, seq: u64) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |entry| entry.seq >= seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct LinkStats {
    pub messages_received: usize,
    pub messages_sent: usize,
    pub decode_failures: usize,
    pub publish_failures: usize,
    pub last_activity: Option<DateTime<Local>>,
}

/// Why relay commands are currently held back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionWarning {
    pub broker_down: bool,
    pub gateway_down: bool,
}

impl ConnectionWarning {
    pub fn lines(&self) -> Vec<&'static str> {
        let mut lines = Vec::new();
        if self.broker_down {
            lines.push("Not connected to MQTT broker.");
        }
        if self.gateway_down {
            lines.push("Gateway is offline or not sending status updates.");
        }
        lines.push("Relay commands will not be sent until connection is established.");
        lines
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DashboardState {
    pub connection: ConnectionState,
    pub motor: MotorStatus,
    pub telemetry: Telemetry,
    pub connectivity: ConnectivitySummary,
    pub relays: RelayBank,
    pub frequency_setpoint: Reconciled<f64>,
    pub logs: LogBuffer,
    pub last_command_at: Option<DateTime<Local>>,
    pub last_status_at: Option<DateTime<Local>>,
    pub stats: LinkStats,
    pub recent_commands: VecDeque<CommandRecord>,
}

impl DashboardState {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            connection: ConnectionState::default(),
            motor: MotorStatus::default(),
            telemetry: Telemetry::default(),
            connectivity: ConnectivitySummary::default(),
            relays: RelayBank::default(),
            frequency_setpoint: Reconciled::new(0.0),
            logs: LogBuffer::with_capacity(log_capacity),
            last_command_at: None,
            last_status_at: None,
            stats: LinkStats::default(),
            recent_commands: VecDeque::with_capacity(COMMAND_HISTORY),
        }
    }

    pub fn can_send_relay_commands(&self) -> bool {
        self.connection.connected() && self.connectivity.gateway_up
    }

    /// Warning banner for the relay view, `None` while commands can flow.
    pub fn connection_warning(&self) -> Option<ConnectionWarning> {
        if self.can_send_relay_commands() {
            return None;
        }
        Some(ConnectionWarning {
            broker_down: !self.connection.connected(),
            gateway_down: !self.connectivity.gateway_up,
        })
    }

    /// Gateway liveness is only known through the broker.
    pub fn mark_link_lost(&mut self) {
        self.connectivity.gateway_up = false;
    }

    pub fn record_command(&mut self, record: CommandRecord) {
        if self.recent_commands.len() == COMMAND_HISTORY {
            self.recent_commands.pop_front();
        }
        self.recent_commands.push_back(record);
    }

    pub fn update_delivery(&mut self, id: u64, delivery: Delivery) {
        if let Some(record) = self.recent_commands.iter_mut().find(|r| r.id == id) {
            record.delivery = delivery;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motor_state_maps_case_insensitively() {
        assert_eq!(MotorState::from_wire("Running"), MotorState::Running);
        assert_eq!(MotorState::from_wire("STOPPED"), MotorState::Stopped);
        assert_eq!(MotorState::from_wire("Tripped"), MotorState::Unknown);
        assert_eq!(MotorState::default(), MotorState::Unknown);
    }

    #[test]
    fn log_buffer_evicts_oldest_first() {
        let mut logs = LogBuffer::with_capacity(3);
        let now = Local::now();
        for i in 0..5 {
            logs.push(now, format!("line {}", i));
        }

        let messages: Vec<&str> = logs.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(logs.evicted(), 2);
        assert_eq!(logs.next_seq(), 5);
        assert_eq!(logs.since(4).count(), 1);
    }

    #[test]
    fn published_request_is_confirmed_on_resolve() {
        let mut relay = Reconciled::new(false);
        relay.request(true, true);
        assert_eq!(relay.phase(), SyncPhase::Pending);

        relay.resolve();
        assert_eq!(relay.phase(), SyncPhase::InSync);
        assert!(*relay.desired());
        assert!(*relay.confirmed());
    }

    #[test]
    fn unsent_request_rolls_back_on_resolve() {
        let mut relay = Reconciled::new(false);
        relay.request(true, false);
        assert_eq!(relay.phase(), SyncPhase::Unsent);
        assert!(relay.is_diverged());

        relay.resolve();
        assert_eq!(relay.phase(), SyncPhase::InSync);
        assert!(!*relay.desired());
    }

    #[test]
    fn toggling_back_without_publish_is_in_sync() {
        let mut relay = Reconciled::new(false);
        relay.request(true, false);
        relay.request(false, false);
        assert_eq!(relay.phase(), SyncPhase::InSync);
    }

    #[test]
    fn reported_value_overrides_desired() {
        let mut relay = Reconciled::new(false);
        relay.request(true, true);
        relay.confirm(false);
        assert_eq!(relay.phase(), SyncPhase::InSync);
        assert!(!*relay.desired());
    }

    #[test]
    fn warning_lists_each_missing_link() {
        let mut state = DashboardState::new(10);
        let warning = state.connection_warning().unwrap();
        assert!(warning.broker_down);
        assert!(warning.gateway_down);
        assert_eq!(warning.lines().len(), 3);

        state.connection.phase = LinkPhase::Connected;
        state.connectivity.gateway_up = true;
        assert!(state.connection_warning().is_none());
    }
}
