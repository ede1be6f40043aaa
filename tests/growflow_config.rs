use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use growflow::config::{GrowflowConfig, RunMode};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "GROWFLOW_CONFIG",
        "GROWFLOW_ENV",
        "GROWFLOW_DB_PATH",
        "MQTT_BROKER",
        "MQTT_PORT",
        "MQTT_USERNAME",
        "MQTT_PASSWORD",
        "MQTT_TOPIC_PREFIX",
        "HA_DISCOVERY_PREFIX",
        "MQTT_USE_TLS",
        "MQTT_TLS_CA_PATH",
        "MQTT_TLS_CLIENT_CERT_PATH",
        "MQTT_TLS_CLIENT_KEY_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = GrowflowConfig::load().expect("load config");

    assert_eq!(cfg.mode, RunMode::Development);
    assert_eq!(cfg.db_path, "growflow.db");
    assert_eq!(cfg.mqtt.broker, "localhost");
    assert_eq!(cfg.mqtt.port, 1883);
    assert_eq!(cfg.mqtt.topic_prefix, "growflow");
    assert_eq!(cfg.mqtt.discovery_prefix, "homeassistant");
    assert_eq!(cfg.mqtt.username, None);
    assert!(cfg.mqtt_offline());
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "mode": "production",
        "db_path": "/var/lib/growflow/growflow.db",
        "mqtt": {
            "broker": "core-mosquitto",
            "port": 1884,
            "username": "growflow",
            "password": "from-file",
            "topic_prefix": "greenhouse",
            "keep_alive_secs": 30
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("GROWFLOW_CONFIG", file.path());
    std::env::set_var("MQTT_PASSWORD", "from-env");
    std::env::set_var("HA_DISCOVERY_PREFIX", "ha");

    let cfg = GrowflowConfig::load().expect("load config");

    assert_eq!(cfg.mode, RunMode::Production);
    assert_eq!(cfg.db_path, "/var/lib/growflow/growflow.db");
    assert_eq!(cfg.mqtt.broker, "core-mosquitto");
    assert_eq!(cfg.mqtt.port, 1884);
    assert_eq!(cfg.mqtt.username.as_deref(), Some("growflow"));
    assert_eq!(cfg.mqtt.password.as_deref(), Some("from-env"));
    assert_eq!(cfg.mqtt.topic_prefix, "greenhouse");
    assert_eq!(cfg.mqtt.discovery_prefix, "ha");
    assert_eq!(cfg.mqtt.keep_alive, Duration::from_secs(30));
    assert!(!cfg.mqtt_offline());

    let topics = cfg.mqtt.topics();
    assert_eq!(topics.status(), "greenhouse/status");

    clear_env();
}

#[test]
fn remote_broker_in_development_is_online() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("MQTT_BROKER", "mqtts://broker.lan:8883");
    let cfg = GrowflowConfig::load().expect("load config");
    assert_eq!(cfg.mode, RunMode::Development);
    assert!(!cfg.mqtt_offline());
    let endpoint = cfg.mqtt.endpoint().expect("endpoint");
    assert_eq!(endpoint.host, "broker.lan");
    assert_eq!(endpoint.port, 8883);
    assert!(endpoint.use_tls);

    clear_env();
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("MQTT_PORT", "not-a-port");
    let err = GrowflowConfig::load().unwrap_err();
    assert!(err.to_string().contains("MQTT_PORT"));
    clear_env();

    std::env::set_var("MQTT_TOPIC_PREFIX", "grow/+/x");
    let err = GrowflowConfig::load().unwrap_err();
    assert!(err.to_string().contains("wildcards"));
    clear_env();

    std::env::set_var("MQTT_TLS_CA_PATH", "/etc/ssl/ca.pem");
    let err = GrowflowConfig::load().unwrap_err();
    assert!(err.to_string().contains("TLS is disabled"));

    clear_env();
}

#[test]
fn unknown_env_mode_runs_as_development() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("GROWFLOW_ENV", "staging");
    let cfg = GrowflowConfig::load().expect("load config");
    assert_eq!(cfg.mode, RunMode::Development);
    assert!(cfg.mqtt_offline());

    std::env::set_var("GROWFLOW_ENV", "production");
    let cfg = GrowflowConfig::load().expect("load config");
    assert_eq!(cfg.mode, RunMode::Production);
    assert!(!cfg.mqtt_offline());

    clear_env();
}

#[test]
fn rejects_malformed_config_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("GROWFLOW_CONFIG", file.path());

    let err = GrowflowConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
