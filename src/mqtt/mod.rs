//! Home Assistant MQTT integration.
//!
//! - `topics`: pure topic and `unique_id` derivation
//! - `discovery`: retained discovery config payloads
//! - `service`: the broker session, discovery pass and state publishing

pub mod discovery;
pub mod topics;

mod service;

pub use service::{
    AppStatus, ConnectionState, GrowAreaReading, MqttService, PlantReading, CLIENT_ID_PREFIX,
    CONNECT_TIMEOUT, RECONNECT_INTERVAL,
};
