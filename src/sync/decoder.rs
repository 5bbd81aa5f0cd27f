//! Inbound message decoding.
//!
//! Turns one broker message into at most one state update. Status payloads are
//! JSON and may be partial: absent fields keep their previous value, except `fault`
//! which falls back to `"None"`. Log payloads are opaque text.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::commands::{MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ};
use super::error::DecodeError;
use super::model::{DashboardState, MotorState, NO_FAULT, RELAY_COUNT};
use crate::mqtt::config::TopicNames;
use crate::mqtt::message_manager::{InboundMessage, Topic};

/// What to do with inbound numbers outside their physical range.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InboundPolicy {
    /// Clamp into range and log the affected fields.
    #[default]
    Clamp,
    /// Drop the whole status message.
    Reject,
    /// Apply values verbatim.
    Trust,
}

/// Status payload published by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusReport {
    #[serde(rename = "motorState")]
    pub motor_state: Option<String>,
    pub frequency: Option<f64>,
    pub rpm: Option<f64>,
    pub current: Option<f64>,
    pub voltage: Option<f64>,
    pub fault: Option<String>,
    pub vfd_responding: Option<bool>,
    pub esp32_online: Option<bool>,
    /// Confirmed relay states, when the firmware reports them.
    pub relays: Option<Vec<bool>>,
}

impl StatusReport {
    /// Projects the report onto the view state in one step.
    pub fn apply_to(&self, state: &mut DashboardState, received_at: DateTime<Local>) {
        if let Some(motor_state) = &self.motor_state {
            state.motor.state = MotorState::from_wire(motor_state);
        }
        if let Some(frequency) = self.frequency {
            state.motor.frequency_hz = frequency;
            state.telemetry.frequency_hz = frequency;
        }
        if let Some(rpm) = self.rpm {
            state.motor.rpm = rpm.round() as u32;
        }
        if let Some(current) = self.current {
            state.telemetry.current_amps = current;
        }
        if let Some(voltage) = self.voltage {
            state.telemetry.voltage_volts = voltage;
        }
        state.telemetry.fault = match self.fault.as_deref() {
            Some(fault) if !fault.trim().is_empty() => fault.to_string(),
            _ => NO_FAULT.to_string(),
        };

        if let Some(responding) = self.vfd_responding {
            state.connectivity.drive_responding = responding;
        }
        // A status message getting through proves the uplink and the gateway are alive.
        state.connectivity.gsm_up = true;
        state.connectivity.gateway_up = self.esp32_online.unwrap_or(true);

        match &self.relays {
            Some(reported) if reported.len() == RELAY_COUNT => state.relays.confirm_all(reported),
            Some(reported) => {
                warn!(
                    "Ignoring relay report with {} entries, expected {}",
                    reported.len(),
                    RELAY_COUNT
                );
                state.relays.resolve_all();
            }
            None => state.relays.resolve_all(),
        }
        state.frequency_setpoint.resolve();
        state.last_status_at = Some(received_at);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Status(StatusReport),
    Log(String),
}

#[derive(Debug, Clone)]
pub struct MessageDecoder {
    topics: TopicNames,
    policy: InboundPolicy,
}

impl MessageDecoder {
    pub fn new(topics: TopicNames, policy: InboundPolicy) -> Self {
        Self { topics, policy }
    }

    /// `Ok(None)` for topics that carry nothing for the views.
    pub fn decode(&self, message: &InboundMessage) -> Result<Option<Decoded>, DecodeError> {
        match Topic::classify(&message.topic, &self.topics) {
            Some(Topic::Status) => {
                let report: StatusReport = serde_json::from_slice(&message.payload)?;
                Ok(Some(Decoded::Status(self.validate(report)?)))
            }
            Some(Topic::Logs) => Ok(Some(Decoded::Log(message.text()))),
            Some(topic) => {
                debug!("Ignoring message on outbound topic {:?}", topic);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn validate(&self, mut report: StatusReport) -> Result<StatusReport, DecodeError> {
        let mut clamped = Vec::new();
        self.check_range(
            "frequency",
            &mut report.frequency,
            MIN_FREQUENCY_HZ,
            MAX_FREQUENCY_HZ,
            &mut clamped,
        )?;
        self.check_range("rpm", &mut report.rpm, 0.0, f64::INFINITY, &mut clamped)?;
        self.check_range("current", &mut report.current, 0.0, f64::INFINITY, &mut clamped)?;
        self.check_range("voltage", &mut report.voltage, 0.0, f64::INFINITY, &mut clamped)?;

        if !clamped.is_empty() {
            warn!("Clamped out-of-range status fields: {}", clamped.join(", "));
        }
        Ok(report)
    }

    fn check_range(
        &self,
        field: &'static str,
        value: &mut Option<f64>,
        min: f64,
        max: f64,
        clamped: &mut Vec<&'static str>,
    ) -> Result<(), DecodeError> {
        let Some(current) = value.as_mut() else {
            return Ok(());
        };
        if (min..=max).contains(current) {
            return Ok(());
        }

        match self.policy {
            InboundPolicy::Trust => Ok(()),
            InboundPolicy::Reject => Err(DecodeError::OutOfRange {
                field,
                value: *current,
            }),
            InboundPolicy::Clamp => {
                *current = current.clamp(min, max);
                clamped.push(field);
                Ok(())
            }
        }
    }
}
