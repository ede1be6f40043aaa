//! Broker endpoint parsing and TLS transport selection.
//!
//! Compatible with Home Assistant's Mosquitto add-on patterns:
//! - CA verification: custom CA path or system roots
//! - Client certificates: mutual TLS support
//! - Insecure mode: not offered

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::PathBuf;

/// TLS certificate materials for MQTT connections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsMaterials {
    /// PEM-encoded CA certificate bytes. `None` uses the webpki roots.
    pub ca: Option<Vec<u8>>,

    /// Client certificate and key for mutual TLS, (cert, key).
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Load TLS materials from file paths. Client cert and key must be
    /// provided together.
    pub fn load(
        ca_path: Option<&PathBuf>,
        client_cert_path: Option<&PathBuf>,
        client_key_path: Option<&PathBuf>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!(
                        "failed to read MQTT TLS client cert '{}'",
                        cert_path.display()
                    )
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!(
                        "failed to read MQTT TLS client key '{}'",
                        key_path.display()
                    )
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

/// Broker host, port and whether to speak TLS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    /// Build a rumqttc `Transport` for this endpoint.
    ///
    /// # Errors
    /// - TLS materials provided but TLS is disabled
    /// - client certificates provided without a CA
    pub fn build_transport(&self, materials: &TlsMaterials) -> Result<Transport> {
        if !self.use_tls {
            if materials.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but TLS is disabled.\n\
                     Set MQTT_USE_TLS or use the mqtts:// scheme to enable TLS."
                ));
            }
            return Ok(Transport::tcp());
        }

        if !materials.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }

        let ca = materials.ca.clone().ok_or_else(|| {
            anyhow!(
                "MQTT TLS CA certificate is required when providing client certificates.\n\
                 Set MQTT_TLS_CA_PATH or remove the client cert configuration."
            )
        })?;

        Ok(Transport::tls(ca, materials.client_auth.clone(), None))
    }
}

/// Parse a broker address.
///
/// Supports formats:
/// - `host` (port taken from `default_port`)
/// - `host:port`
/// - `mqtt://host:port` / `tcp://host:port` (plain TCP)
/// - `mqtts://host:port` / `ssl://host:port` (TLS)
/// - `[ipv6]:port`
pub fn parse_mqtt_endpoint(addr: &str, default_port: u16, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    if remainder.is_empty() {
        return Err(anyhow!("MQTT broker address is empty"));
    }

    let (host, port) = split_host_port(remainder, default_port)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?,
            None if rest.is_empty() => default_port,
            None => return Err(anyhow!("invalid MQTT address: {}", addr)),
        };
        return Ok((host.to_string(), port));
    }

    // A bare IPv6 literal has several colons and no port.
    if addr.matches(':').count() > 1 {
        return Ok((addr.to_string(), default_port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), default_port)),
    }
}
