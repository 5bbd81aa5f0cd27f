//! # View State Synchronization
//!
//! Connects the broker link to the views. Inbound messages are decoded and projected
//! onto a [`DashboardState`](model::DashboardState); operator intents are encoded as
//! commands and handed to the broker client.
//!
//! ```text
//! BrokerEvent ──► decoder ──┐
//!                           ├──► Synchronizer ──watch──► views
//! Intent ─────► commands ───┘          │
//!                                      └──► CommandSink (broker client)
//! ```
//!
//! Relays and the frequency setpoint are optimistic: they change locally as soon as the
//! operator acts and are reconciled with the next status message.

pub mod commands;
pub mod decoder;
pub mod error;
pub mod model;
pub mod synchronizer;
