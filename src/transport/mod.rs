//! Transport layer for the MQTT bridge.
//!
//! Broker endpoint parsing and TLS selection live in `tls`; the session seam
//! (connector, link, lifecycle events) and its rumqttc implementation live in
//! `link`.

mod link;
mod tls;

pub use link::{BrokerLink, Connector, RumqttcConnector, SessionEvents, SessionOptions};
pub use tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};
