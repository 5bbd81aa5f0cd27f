//! # MQTT Integration Module
//!
//! The broker connection used by every view of the supervisor. One [`BrokerLink`]
//! exists per session; views never open their own connection.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker URL parsing, topic names, rumqttc options
//! ├── message_manager.rs  - Topics, inbound messages and broker events
//! └── mqtt_handler.rs     - Connection typestate machine and event loop task
//! ```
//!
//! Status and log topics are subscribed at QoS 0. Commands are published at QoS 1 so
//! the broker's `PubAck` can be reported back per command.
//!
//! [`BrokerLink`]: mqtt_handler::BrokerLink

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
