//! Directory records for grow areas and plants.
//!
//! These are the read-side projections the MQTT bridge works from. They are
//! produced by an [`crate::directory::EntityDirectory`] and are never cached:
//! every discovery pass gets a fresh snapshot.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use anyhow::{anyhow, Result};

const SECONDS_PER_DAY: u64 = 60 * 60 * 24;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowAreaKind {
    #[default]
    Indoor,
    Outdoor,
}

impl GrowAreaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Indoor => "indoor",
            Self::Outdoor => "outdoor",
        }
    }
}

impl FromStr for GrowAreaKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "indoor" => Ok(Self::Indoor),
            "outdoor" => Ok(Self::Outdoor),
            other => Err(anyhow!(
                "unknown grow area type '{}': expected 'indoor' or 'outdoor'",
                other
            )),
        }
    }
}

/// A grow area with its plants nested.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GrowArea {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: GrowAreaKind,
    #[serde(default)]
    pub automation_enabled: bool,
    #[serde(default)]
    pub plants: Vec<Plant>,
}

/// One phase instance on a plant's timeline (germination, vegetation, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlantPhase {
    pub name: String,
    /// Phase start in seconds since epoch, if the phase has started.
    #[serde(default)]
    pub start_epoch_s: Option<u64>,
    #[serde(default)]
    pub duration_min: u32,
    #[serde(default)]
    pub duration_max: u32,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_completed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plant {
    pub id: i64,
    pub grow_area_id: i64,
    pub name: String,
    #[serde(default)]
    pub strain: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub phases: Vec<PlantPhase>,
}

fn default_true() -> bool {
    true
}

impl Plant {
    /// The phase the plant is currently in: the first active phase that has
    /// not been completed.
    pub fn active_phase(&self) -> Option<&PlantPhase> {
        self.phases
            .iter()
            .find(|phase| phase.is_active && !phase.is_completed)
    }

    pub fn current_phase(&self) -> Option<&str> {
        self.active_phase().map(|phase| phase.name.as_str())
    }

    /// Whole days elapsed since the current phase started.
    ///
    /// A start date in the future counts as day zero.
    pub fn days_in_phase(&self, now_s: u64) -> Option<u64> {
        let start = self.active_phase()?.start_epoch_s?;
        Some(now_s.saturating_sub(start) / SECONDS_PER_DAY)
    }
}
