//! # Console Rendering Helpers
//!
//! Shared text rendering for the operator console. Each view renders the same
//! [`DashboardState`] snapshot differently; the helpers here keep badge wording and
//! number formatting identical across them.
//!
//! ## Status Badges
//!
//! A [`StatusVariant`] classifies a value the way the web dashboard colours its status
//! pills (neutral, success, error, warning, info). On a terminal the variant becomes
//! a short bracketed tag so the console stays readable without colour support.

use std::fmt::Write;

use crate::sync::commands::{format_frequency, Delivery};
use crate::sync::model::{
    ConnectionState, DashboardState, LinkPhase, LogEntry, MotorState, SyncPhase,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusVariant {
    Default,
    Success,
    Error,
    Warning,
    Info,
}

impl StatusVariant {
    pub fn tag(self) -> &'static str {
        match self {
            StatusVariant::Default => "[--]",
            StatusVariant::Success => "[OK]",
            StatusVariant::Error => "[!!]",
            StatusVariant::Warning => "[~~]",
            StatusVariant::Info => "[..]",
        }
    }
}

pub fn badge(variant: StatusVariant, label: &str) -> String {
    format!("{} {}", variant.tag(), label)
}

pub fn link_variant(connection: &ConnectionState) -> StatusVariant {
    match connection.phase {
        LinkPhase::Connected => StatusVariant::Success,
        LinkPhase::Connecting | LinkPhase::Reconnecting => StatusVariant::Info,
        LinkPhase::Failed => StatusVariant::Error,
        LinkPhase::Disconnected => StatusVariant::Default,
    }
}

pub fn motor_variant(state: MotorState) -> StatusVariant {
    match state {
        MotorState::Running => StatusVariant::Success,
        MotorState::Stopped => StatusVariant::Default,
        MotorState::Unknown => StatusVariant::Warning,
    }
}

pub fn online_variant(up: bool) -> StatusVariant {
    if up {
        StatusVariant::Success
    } else {
        StatusVariant::Error
    }
}

fn online_label(up: bool) -> &'static str {
    if up {
        "Online"
    } else {
        "Offline"
    }
}

fn sync_suffix(phase: SyncPhase) -> &'static str {
    match phase {
        SyncPhase::InSync => "",
        SyncPhase::Pending => " (pending)",
        SyncPhase::Unsent => " (not sent)",
    }
}

pub fn render_connection(connection: &ConnectionState) -> String {
    let mut line = badge(link_variant(connection), &format!("Broker {}", connection.phase));
    if let Some(error) = &connection.last_error {
        let _ = write!(line, " - {}", error);
    }
    line
}

pub fn render_dashboard(state: &DashboardState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", render_connection(&state.connection));
    let _ = writeln!(
        out,
        "{}  {} Hz  {} rpm",
        badge(motor_variant(state.motor.state), &state.motor.state.to_string()),
        format_frequency(state.motor.frequency_hz),
        state.motor.rpm
    );
    let _ = writeln!(
        out,
        "Setpoint {} Hz{}",
        format_frequency(*state.frequency_setpoint.desired()),
        sync_suffix(state.frequency_setpoint.phase())
    );
    let _ = writeln!(
        out,
        "Current {:.1} A  Voltage {:.1} V",
        state.telemetry.current_amps, state.telemetry.voltage_volts
    );
    let fault_variant = if state.telemetry.has_fault() {
        StatusVariant::Error
    } else {
        StatusVariant::Success
    };
    let _ = writeln!(out, "{}", badge(fault_variant, &format!("Fault: {}", state.telemetry.fault)));
    let _ = writeln!(
        out,
        "GSM {}  Gateway {}  VFD {}",
        badge(online_variant(state.connectivity.gsm_up), online_label(state.connectivity.gsm_up)),
        badge(
            online_variant(state.connectivity.gateway_up),
            online_label(state.connectivity.gateway_up)
        ),
        badge(
            online_variant(state.connectivity.drive_responding),
            if state.connectivity.drive_responding {
                "Responding"
            } else {
                "Not responding"
            }
        ),
    );
    if let Some(at) = state.last_command_at {
        let _ = writeln!(out, "Last command at {}", at.format("%H:%M:%S"));
    }
    out
}

pub fn render_relays(state: &DashboardState) -> String {
    let mut out = String::new();
    if let Some(warning) = state.connection_warning() {
        let _ = writeln!(out, "{}", badge(StatusVariant::Warning, "Connection Issue"));
        for line in warning.lines() {
            let _ = writeln!(out, "    {}", line);
        }
    }
    for (index, relay) in state.relays.iter().enumerate() {
        let on = *relay.desired();
        let _ = writeln!(
            out,
            "Relay {}: {}{}",
            index + 1,
            badge(
                if on { StatusVariant::Success } else { StatusVariant::Default },
                if on { "ON" } else { "OFF" }
            ),
            sync_suffix(relay.phase())
        );
    }
    out
}

pub fn render_log_entry(entry: &LogEntry) -> String {
    format!("[{}] {}", entry.timestamp.format("%H:%M:%S"), entry.message)
}

/// Placeholder shown by the log view while it has nothing to list.
pub fn empty_log_hint(state: &DashboardState) -> &'static str {
    if state.connection.connected() {
        "Waiting for logs..."
    } else {
        "Connecting to MQTT broker..."
    }
}

pub fn render_delivery(delivery: &Delivery) -> String {
    match delivery {
        Delivery::Queued => badge(StatusVariant::Info, "queued"),
        Delivery::InFlight(pkid) => badge(StatusVariant::Info, &format!("in flight #{}", pkid)),
        Delivery::Sent => badge(StatusVariant::Success, "sent"),
        Delivery::Acknowledged => badge(StatusVariant::Success, "acknowledged"),
        Delivery::Suppressed(reason) => badge(StatusVariant::Warning, &format!("not sent: {}", reason)),
        Delivery::Failed(reason) => badge(StatusVariant::Error, &format!("failed: {}", reason)),
    }
}

pub fn render_config_error(view: &str, error: &str) -> String {
    format!(
        "{}\n    {} cannot start.\n    {}\n    Set the variables (or a .env file) and restart.",
        badge(StatusVariant::Error, "Configuration Error"),
        view,
        error
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    #[test]
    fn relay_view_shows_warning_banner_while_offline() {
        let state = DashboardState::new(10);
        let rendered = render_relays(&state);
        assert!(rendered.contains("Connection Issue"));
        assert!(rendered.contains("Not connected to MQTT broker."));
        assert!(rendered.contains("Relay 4: [--] OFF"));
    }

    #[test]
    fn relay_view_marks_unsent_toggles() {
        let mut state = DashboardState::new(10);
        state.connection.phase = LinkPhase::Connected;
        state.connectivity.gateway_up = true;
        state.relays.channel_mut(0).unwrap().request(true, false);

        let rendered = render_relays(&state);
        assert!(!rendered.contains("Connection Issue"));
        assert!(rendered.contains("Relay 1: [OK] ON (not sent)"));
    }

    #[test]
    fn dashboard_formats_setpoint_with_two_decimals() {
        let mut state = DashboardState::new(10);
        state.frequency_setpoint.request(60.0, true);
        let rendered = render_dashboard(&state);
        assert!(rendered.contains("Setpoint 60.00 Hz (pending)"));
        assert!(rendered.contains("Fault: None"));
    }

    #[test]
    fn log_entries_carry_receipt_time() {
        let entry = LogEntry {
            seq: 0,
            timestamp: Local.with_ymd_and_hms(2024, 5, 1, 8, 30, 5).unwrap(),
            message: "VFD ready".to_string(),
        };
        assert_eq!(render_log_entry(&entry), "[08:30:05] VFD ready");
    }

    #[test]
    fn connection_line_includes_last_error() {
        let connection = ConnectionState {
            phase: LinkPhase::Failed,
            last_error: Some("connection refused".to_string()),
        };
        assert_eq!(
            render_connection(&connection),
            "[!!] Broker Failed - connection refused"
        );
    }
}
