use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::mqtt::topics::{Topics, DEFAULT_DISCOVERY_PREFIX, DEFAULT_TOPIC_PREFIX};
use crate::transport::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};

const DEFAULT_DB_PATH: &str = "growflow.db";
const DEFAULT_BROKER: &str = "localhost";
const DEFAULT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

#[derive(Debug, Deserialize, Default)]
struct GrowflowConfigFile {
    mode: Option<String>,
    db_path: Option<String>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    topic_prefix: Option<String>,
    discovery_prefix: Option<String>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    keep_alive_secs: Option<u64>,
}

/// Deployment mode. Anything but production may run without a broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Development,
    Production,
}

impl FromStr for RunMode {
    type Err = std::convert::Infallible;

    /// Only `production` (or `prod`) selects production; `test`, `staging`
    /// and any other value run as development.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => {
                log::warn!("unrecognized mode '{}', running as development", other);
                Ok(Self::Development)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Host, `host:port` or `mqtt[s]://host:port`.
    pub broker: String,
    /// Used when `broker` carries no port.
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub keep_alive: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker: DEFAULT_BROKER.to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            discovery_prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
            use_tls: false,
            tls_ca_path: None,
            tls_client_cert_path: None,
            tls_client_key_path: None,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
        }
    }
}

impl MqttSettings {
    pub fn endpoint(&self) -> Result<MqttEndpoint> {
        parse_mqtt_endpoint(&self.broker, self.port, self.use_tls)
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.topic_prefix, &self.discovery_prefix)
    }

    pub fn tls_materials(&self) -> Result<TlsMaterials> {
        TlsMaterials::load(
            self.tls_ca_path.as_ref(),
            self.tls_client_cert_path.as_ref(),
            self.tls_client_key_path.as_ref(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct GrowflowConfig {
    pub mode: RunMode,
    pub db_path: String,
    pub mqtt: MqttSettings,
}

impl Default for GrowflowConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            db_path: DEFAULT_DB_PATH.to_string(),
            mqtt: MqttSettings::default(),
        }
    }
}

impl GrowflowConfig {
    /// Load from the JSON file named by `GROWFLOW_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GROWFLOW_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => GrowflowConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GrowflowConfigFile) -> Result<Self> {
        let mode = match file.mode.as_deref() {
            Some(mode) => mode.parse()?,
            None => RunMode::default(),
        };
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let mqtt_file = file.mqtt.unwrap_or_default();
        let defaults = MqttSettings::default();
        let mqtt = MqttSettings {
            broker: mqtt_file.broker.unwrap_or(defaults.broker),
            port: mqtt_file.port.unwrap_or(defaults.port),
            username: mqtt_file.username,
            password: mqtt_file.password,
            topic_prefix: mqtt_file.topic_prefix.unwrap_or(defaults.topic_prefix),
            discovery_prefix: mqtt_file
                .discovery_prefix
                .unwrap_or(defaults.discovery_prefix),
            use_tls: mqtt_file.use_tls.unwrap_or(false),
            tls_ca_path: mqtt_file.tls_ca_path,
            tls_client_cert_path: mqtt_file.tls_client_cert_path,
            tls_client_key_path: mqtt_file.tls_client_key_path,
            keep_alive: mqtt_file
                .keep_alive_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.keep_alive),
        };
        Ok(Self {
            mode,
            db_path,
            mqtt,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(mode) = non_empty_env("GROWFLOW_ENV") {
            self.mode = mode.parse()?;
        }
        if let Some(path) = non_empty_env("GROWFLOW_DB_PATH") {
            self.db_path = path;
        }
        if let Some(broker) = non_empty_env("MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(port) = non_empty_env("MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .map_err(|_| anyhow!("MQTT_PORT must be a port number, got '{}'", port))?;
        }
        if let Some(user) = non_empty_env("MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(prefix) = non_empty_env("MQTT_TOPIC_PREFIX") {
            self.mqtt.topic_prefix = prefix;
        }
        if let Some(prefix) = non_empty_env("HA_DISCOVERY_PREFIX") {
            self.mqtt.discovery_prefix = prefix;
        }
        if let Some(flag) = non_empty_env("MQTT_USE_TLS") {
            self.mqtt.use_tls = parse_flag("MQTT_USE_TLS", &flag)?;
        }
        if let Some(path) = non_empty_env("MQTT_TLS_CA_PATH") {
            self.mqtt.tls_ca_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env("MQTT_TLS_CLIENT_CERT_PATH") {
            self.mqtt.tls_client_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env("MQTT_TLS_CLIENT_KEY_PATH") {
            self.mqtt.tls_client_key_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_topic_prefix("topic prefix", &self.mqtt.topic_prefix)?;
        validate_topic_prefix("discovery prefix", &self.mqtt.discovery_prefix)?;
        if self.mqtt.port == 0 {
            return Err(anyhow!("MQTT port must be greater than zero"));
        }
        if self.mqtt.keep_alive.as_secs() == 0 {
            return Err(anyhow!("MQTT keep alive must be greater than zero"));
        }
        let endpoint = self.mqtt.endpoint()?;
        match (
            &self.mqtt.tls_client_cert_path,
            &self.mqtt.tls_client_key_path,
        ) {
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
            _ => {}
        }
        let has_tls_material = self.mqtt.tls_ca_path.is_some()
            || self.mqtt.tls_client_cert_path.is_some()
            || self.mqtt.tls_client_key_path.is_some();
        if has_tls_material && !endpoint.use_tls {
            return Err(anyhow!(
                "MQTT TLS material configured but TLS is disabled (set MQTT_USE_TLS or use mqtts://)"
            ));
        }
        Ok(())
    }

    /// Whether the broker session is skipped entirely: outside production,
    /// a broker left at `localhost` means "no broker here".
    pub fn mqtt_offline(&self) -> bool {
        if self.mode == RunMode::Production {
            return false;
        }
        match self.mqtt.endpoint() {
            Ok(endpoint) => endpoint.host == DEFAULT_BROKER,
            Err(_) => false,
        }
    }
}

fn validate_topic_prefix(what: &str, prefix: &str) -> Result<()> {
    let trimmed = prefix.trim_matches('/');
    if trimmed.trim().is_empty() {
        return Err(anyhow!("MQTT {} must not be empty", what));
    }
    if prefix.contains('+') || prefix.contains('#') {
        return Err(anyhow!(
            "MQTT {} '{}' must not contain wildcards",
            what,
            prefix
        ));
    }
    Ok(())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", key, other)),
    }
}

fn read_config_file(path: &Path) -> Result<GrowflowConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
