//! growflow - admin and one-shot MQTT commands
//!
//! Seeds the SQLite directory and drives single discovery / publish /
//! retraction passes against the configured broker.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GrowflowConfig;
use crate::directory::{EntityDirectory, NewGrowArea, NewPlant, SqliteEntityDirectory};
use crate::models::{GrowAreaKind, PlantPhase};
use crate::mqtt::{GrowAreaReading, MqttService, PlantReading};
use crate::transport::RumqttcConnector;
use crate::ui::{Ui, UiMode};

#[derive(Parser, Debug)]
#[command(
    name = "growflow",
    version,
    about = "GrowFlow directory admin and Home Assistant MQTT publishing"
)]
struct Args {
    /// JSON config file
    #[arg(long, env = "GROWFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Override the directory database path
    #[arg(long)]
    db: Option<String>,

    /// Seconds to wait for the broker before giving up
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a grow area to the directory (prints its id)
    AddArea {
        #[arg(long)]
        name: String,
        /// indoor | outdoor
        #[arg(long, default_value = "indoor")]
        kind: String,
        #[arg(long)]
        automation: bool,
    },

    /// Add a plant to a grow area (prints its id)
    AddPlant {
        #[arg(long)]
        area: i64,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        strain: String,
        /// Start the plant in this phase now
        #[arg(long)]
        phase: Option<String>,
        #[arg(long, default_value_t = 0)]
        phase_min_days: u32,
        #[arg(long, default_value_t = 0)]
        phase_max_days: u32,
    },

    /// Print the directory as JSON
    List,

    /// Announce every grow area and plant to Home Assistant
    Discover,

    /// Publish one grow-area reading
    PublishArea {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        humidity: Option<f64>,
        #[arg(long)]
        vpd: Option<f64>,
    },

    /// Publish plant phase data; derived from the directory unless given
    PublishPlant {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        phase: Option<String>,
        #[arg(long)]
        days: Option<u64>,
    },

    /// Remove a grow area's sensors (and its plants') from Home Assistant
    RetractArea {
        #[arg(long)]
        id: i64,
        /// Also delete the grow area from the directory
        #[arg(long)]
        delete: bool,
    },

    /// Remove a plant's sensors from Home Assistant
    RetractPlant {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        delete: bool,
    },
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::detect(args.ui);

    let mut config = GrowflowConfig::load_from(args.config.as_deref())?;
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    let directory = Arc::new(SqliteEntityDirectory::open(&config.db_path)?);
    let ctx = RunContext {
        config: &config,
        directory,
        ui: &ui,
        connect_timeout: Duration::from_secs(args.connect_timeout),
    };

    match args.command {
        Command::AddArea {
            name,
            kind,
            automation,
        } => cmd_add_area(&ctx, &name, &kind, automation),
        Command::AddPlant {
            area,
            name,
            strain,
            phase,
            phase_min_days,
            phase_max_days,
        } => cmd_add_plant(
            &ctx,
            area,
            &name,
            &strain,
            phase.as_deref(),
            (phase_min_days, phase_max_days),
        ),
        Command::List => cmd_list(&ctx),
        Command::Discover => cmd_discover(&ctx),
        Command::PublishArea {
            id,
            temperature,
            humidity,
            vpd,
        } => cmd_publish_area(
            &ctx,
            id,
            GrowAreaReading {
                temperature,
                humidity,
                vpd,
            },
        ),
        Command::PublishPlant { id, phase, days } => cmd_publish_plant(&ctx, id, phase, days),
        Command::RetractArea { id, delete } => cmd_retract_area(&ctx, id, delete),
        Command::RetractPlant { id, delete } => cmd_retract_plant(&ctx, id, delete),
    }
}

struct RunContext<'a> {
    config: &'a GrowflowConfig,
    directory: Arc<SqliteEntityDirectory>,
    ui: &'a Ui,
    connect_timeout: Duration,
}

impl RunContext<'_> {
    /// Connect, wait for the broker and for the announce pass that follows
    /// it. Returns the service and the number of configs announced. The
    /// caller must `disconnect`.
    fn connect(&self) -> Result<(MqttService, usize)> {
        if self.config.mqtt_offline() {
            return Err(anyhow!(
                "MQTT is disabled in offline mode (development mode with broker '{}'); \
                 set MQTT_BROKER or GROWFLOW_ENV=production",
                self.config.mqtt.broker
            ));
        }
        let service = MqttService::new(
            self.config,
            self.directory.clone(),
            Arc::new(RumqttcConnector),
        )?;
        let connecting = self.ui.stage("Connect to MQTT broker");
        service.connect()?;
        if !service.wait_connected(self.connect_timeout) {
            let reason = service
                .last_error()
                .unwrap_or_else(|| "timed out".to_string());
            service.disconnect();
            return Err(anyhow!(
                "could not connect to MQTT broker {}: {}",
                self.config.mqtt.broker,
                reason
            ));
        }
        drop(connecting);

        let mut stage = self.ui.stage("Publish discovery configs");
        let announced = match service.wait_announced(self.connect_timeout) {
            Some(announced) => announced,
            None => {
                log::warn!("Discovery pass did not finish within {:?}", self.connect_timeout);
                0
            }
        };
        stage.set_outcome(format!("{} configs", announced));
        Ok((service, announced))
    }
}

fn cmd_add_area(ctx: &RunContext<'_>, name: &str, kind: &str, automation: bool) -> Result<()> {
    let kind: GrowAreaKind = kind.parse()?;
    let id = ctx.directory.insert_grow_area(&NewGrowArea {
        name,
        kind,
        automation_enabled: automation,
    })?;
    println!("{}", id);
    Ok(())
}

fn cmd_add_plant(
    ctx: &RunContext<'_>,
    area: i64,
    name: &str,
    strain: &str,
    phase: Option<&str>,
    (duration_min, duration_max): (u32, u32),
) -> Result<()> {
    let phases: Vec<PlantPhase> = match phase {
        Some(phase) => vec![PlantPhase {
            name: phase.to_string(),
            start_epoch_s: Some(crate::now_s()?),
            duration_min,
            duration_max,
            is_active: true,
            is_completed: false,
        }],
        None => Vec::new(),
    };
    let id = ctx.directory.insert_plant(&NewPlant {
        grow_area_id: area,
        name,
        strain,
        phases: &phases,
    })?;
    println!("{}", id);
    Ok(())
}

fn cmd_list(ctx: &RunContext<'_>) -> Result<()> {
    let areas = ctx.directory.fetch_entity_directory()?;
    let json = serde_json::to_string_pretty(&areas).context("failed to encode directory")?;
    println!("{}", json);
    Ok(())
}

fn cmd_discover(ctx: &RunContext<'_>) -> Result<()> {
    let (service, announced) = ctx.connect()?;
    service.disconnect();
    if announced == 0 {
        log::warn!("No discovery configs published");
    }
    Ok(())
}

fn cmd_publish_area(ctx: &RunContext<'_>, id: i64, reading: GrowAreaReading) -> Result<()> {
    let (service, _) = ctx.connect()?;
    let published = service.publish_grow_area_data(id, &reading);
    service.disconnect();
    log::info!("Published {} values for grow area {}", published, id);
    Ok(())
}

fn cmd_publish_plant(
    ctx: &RunContext<'_>,
    id: i64,
    phase: Option<String>,
    days: Option<u64>,
) -> Result<()> {
    let reading = if phase.is_some() || days.is_some() {
        PlantReading {
            phase,
            days_in_phase: days,
        }
    } else {
        let plant = ctx
            .directory
            .fetch_entity_directory()?
            .into_iter()
            .flat_map(|area| area.plants)
            .find(|plant| plant.id == id)
            .ok_or_else(|| anyhow!("plant {} not found", id))?;
        PlantReading::from_plant(&plant, crate::now_s()?)
    };
    let (service, _) = ctx.connect()?;
    let published = service.publish_plant_data(id, &reading);
    service.disconnect();
    log::info!("Published {} values for plant {}", published, id);
    Ok(())
}

fn cmd_retract_area(ctx: &RunContext<'_>, id: i64, delete: bool) -> Result<()> {
    let plant_ids = ctx.directory.plant_ids_for_area(id)?;
    let (service, _) = ctx.connect()?;
    let mut retracted = service.retract_grow_area(id);
    for plant_id in &plant_ids {
        retracted += service.retract_plant(*plant_id);
    }
    service.disconnect();
    log::info!("Retracted {} discovery configs", retracted);

    if delete && !ctx.directory.delete_grow_area(id)? {
        return Err(anyhow!("grow area {} not found", id));
    }
    Ok(())
}

fn cmd_retract_plant(ctx: &RunContext<'_>, id: i64, delete: bool) -> Result<()> {
    let (service, _) = ctx.connect()?;
    let retracted = service.retract_plant(id);
    service.disconnect();
    log::info!("Retracted {} discovery configs", retracted);

    if delete && !ctx.directory.delete_plant(id)? {
        return Err(anyhow!("plant {} not found", id));
    }
    Ok(())
}
