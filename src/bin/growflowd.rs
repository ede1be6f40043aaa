//! growflowd - GrowFlow Home Assistant bridge daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + environment)
//! 2. Opens the SQLite entity directory
//! 3. Connects to the MQTT broker and announces every grow area and plant
//!    whenever the broker accepts the session
//! 4. Optionally re-publishes plant phase snapshots on an interval
//! 5. Publishes a retained `offline` status and disconnects on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use growflow::{
    EntityDirectory, GrowflowConfig, MqttService, RumqttcConnector, SqliteEntityDirectory,
};

#[derive(Parser, Debug)]
#[command(name = "growflowd", version, about = "GrowFlow Home Assistant MQTT bridge")]
struct Args {
    /// JSON config file
    #[arg(long, env = "GROWFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Override the directory database path
    #[arg(long)]
    db: Option<String>,

    /// Re-publish plant phase data every N seconds (0 disables)
    #[arg(long, env = "GROWFLOW_PUBLISH_INTERVAL", default_value_t = 0)]
    publish_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = GrowflowConfig::load_from(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.db_path = db;
    }
    log::info!(
        "growflowd {} starting ({:?} mode, directory {})",
        env!("CARGO_PKG_VERSION"),
        config.mode,
        config.db_path
    );

    let directory = Arc::new(SqliteEntityDirectory::open(&config.db_path)?);
    let service = MqttService::new(&config, directory.clone(), Arc::new(RumqttcConnector))?;
    service.connect()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("growflowd waiting for shutdown signal (Ctrl-C)...");
    if args.publish_interval == 0 {
        let _ = rx.recv();
    } else {
        let interval = Duration::from_secs(args.publish_interval);
        loop {
            match rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => publish_snapshots(&service, directory.as_ref()),
            }
        }
    }

    log::info!("shutdown signal received, closing MQTT session...");
    service.disconnect();
    Ok(())
}

fn publish_snapshots(service: &MqttService, directory: &dyn EntityDirectory) {
    if !service.is_connected() {
        return;
    }
    let areas = match directory.fetch_entity_directory() {
        Ok(areas) => areas,
        Err(e) => {
            log::warn!("snapshot skipped, directory unavailable: {:#}", e);
            return;
        }
    };
    let now_s = match growflow::now_s() {
        Ok(now_s) => now_s,
        Err(e) => {
            log::warn!("snapshot skipped, clock error: {}", e);
            return;
        }
    };
    let published: usize = areas
        .iter()
        .flat_map(|area| area.plants.iter())
        .filter(|plant| plant.is_active)
        .map(|plant| service.publish_plant_snapshot(plant, now_s))
        .sum();
    log::debug!("published {} plant values", published);
}
