//! GrowFlow MQTT bridge
//!
//! Exposes GrowFlow grow areas and plants to Home Assistant over MQTT.
//!
//! # Module Structure
//!
//! - `models`: grow area / plant records read from the directory
//! - `directory`: the `EntityDirectory` seam with SQLite and in-memory stores
//! - `mqtt`: topic derivation, discovery payloads and the broker session
//! - `transport`: broker endpoint parsing, TLS and the rumqttc session
//! - `config`: file + environment configuration
//! - `cli` / `ui`: the admin command line and its stage output

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod cli;
pub mod config;
pub mod directory;
pub mod models;
pub mod mqtt;
pub mod transport;
pub mod ui;

pub use config::{GrowflowConfig, MqttSettings, RunMode};
pub use directory::{EntityDirectory, InMemoryEntityDirectory, SqliteEntityDirectory};
pub use models::{GrowArea, GrowAreaKind, Plant, PlantPhase};
pub use mqtt::{AppStatus, ConnectionState, GrowAreaReading, MqttService, PlantReading};
pub use transport::{BrokerLink, Connector, RumqttcConnector, SessionEvents, SessionOptions};

pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Milliseconds since the epoch; 0 if the clock is before it.
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
