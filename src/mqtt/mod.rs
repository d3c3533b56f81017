//! # MQTT Integration Module
//!
//! Bus side of the bridge: retained state documents out, writable field
//! commands in.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - topic layout derived from the mqtt settings
//! ├── message_manager.rs  - StatePublisher contract and state documents
//! └── mqtt_handler.rs     - rumqttc client, event loop and availability
//! ```
//!
//! The bus runs its own retry track. Broker outages never touch the device
//! session, and the poll loop keeps publishing into the client queue while
//! the broker is away.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
