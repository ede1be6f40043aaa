//! Home Assistant MQTT Discovery payloads.
//!
//! One typed [`SensorFacetConfig`] per facet, built by a factory per entity
//! kind. Payloads depend only on the record passed in, so announcing the same
//! directory twice yields byte-identical retained messages.

use anyhow::Result;
use serde::Serialize;

use super::topics::{entity_id, unique_id, EntityKind, Facet, Topics};
use crate::models::{GrowArea, Plant};

pub const MANUFACTURER: &str = "GrowFlow";
pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Home Assistant device info for entity grouping.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AvailabilityInfo {
    pub topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
}

/// Discovery config for one sensor facet.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SensorFacetConfig {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    pub device: DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<AvailabilityInfo>,
}

impl SensorFacetConfig {
    pub fn config_topic(&self, topics: &Topics) -> String {
        topics.config(&self.unique_id)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

struct FacetSpec {
    facet: Facet,
    label: &'static str,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
}

const GROW_AREA_FACETS: [FacetSpec; 3] = [
    FacetSpec {
        facet: Facet::Temperature,
        label: "Temperature",
        unit: Some("°C"),
        device_class: Some("temperature"),
    },
    FacetSpec {
        facet: Facet::Humidity,
        label: "Humidity",
        unit: Some("%"),
        device_class: Some("humidity"),
    },
    FacetSpec {
        facet: Facet::Vpd,
        label: "VPD",
        unit: Some("kPa"),
        device_class: None,
    },
];

const PLANT_FACETS: [FacetSpec; 2] = [
    FacetSpec {
        facet: Facet::Phase,
        label: "Phase",
        unit: None,
        device_class: None,
    },
    FacetSpec {
        facet: Facet::DaysInPhase,
        label: "Days in Phase",
        unit: Some("days"),
        device_class: None,
    },
];

fn device_info(kind: EntityKind, id: i64, name: &str) -> DeviceInfo {
    let model = match kind {
        EntityKind::GrowArea => "Grow Area",
        EntityKind::Plant => "Plant",
    };
    DeviceInfo {
        identifiers: vec![entity_id(kind, id)],
        name: name.to_string(),
        manufacturer: MANUFACTURER.to_string(),
        model: model.to_string(),
        sw_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

fn build_configs(
    kind: EntityKind,
    id: i64,
    name: &str,
    specs: &[FacetSpec],
    topics: &Topics,
    availability: Option<AvailabilityInfo>,
) -> Vec<SensorFacetConfig> {
    let device = device_info(kind, id, name);
    specs
        .iter()
        .map(|spec| SensorFacetConfig {
            name: format!("{} {}", name, spec.label),
            unique_id: unique_id(kind, id, spec.facet),
            state_topic: topics.state(kind, id, spec.facet),
            unit_of_measurement: spec.unit.map(str::to_string),
            device_class: spec.device_class.map(str::to_string),
            device: device.clone(),
            availability: availability.clone(),
        })
        .collect()
}

/// Temperature, humidity and VPD configs for a grow area. These carry an
/// availability block bound to the app status topic.
pub fn grow_area_configs(area: &GrowArea, topics: &Topics) -> Vec<SensorFacetConfig> {
    let availability = AvailabilityInfo {
        topic: topics.status(),
        payload_available: PAYLOAD_ONLINE.to_string(),
        payload_not_available: PAYLOAD_OFFLINE.to_string(),
    };
    build_configs(
        EntityKind::GrowArea,
        area.id,
        &area.name,
        &GROW_AREA_FACETS,
        topics,
        Some(availability),
    )
}

/// Phase and days-in-phase configs for a plant.
pub fn plant_configs(plant: &Plant, topics: &Topics) -> Vec<SensorFacetConfig> {
    build_configs(
        EntityKind::Plant,
        plant.id,
        &plant.name,
        &PLANT_FACETS,
        topics,
        None,
    )
}

/// Every config of a directory snapshot, in announcement order: each grow
/// area followed by its plants.
pub fn directory_configs(areas: &[GrowArea], topics: &Topics) -> Vec<SensorFacetConfig> {
    let mut out = Vec::new();
    for area in areas {
        out.extend(grow_area_configs(area, topics));
        for plant in &area.plants {
            out.extend(plant_configs(plant, topics));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GrowAreaKind, Plant};
    use serde_json::Value;

    fn area() -> GrowArea {
        GrowArea {
            id: 1,
            name: "Tent A".to_string(),
            kind: GrowAreaKind::Indoor,
            automation_enabled: true,
            plants: vec![Plant {
                id: 5,
                grow_area_id: 1,
                name: "Gelato".to_string(),
                strain: "Gelato 41".to_string(),
                is_active: true,
                phases: Vec::new(),
            }],
        }
    }

    #[test]
    fn grow_area_configs_cover_three_facets() {
        let configs = grow_area_configs(&area(), &Topics::default());
        let ids: Vec<_> = configs.iter().map(|c| c.unique_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "grow_area_1_temperature",
                "grow_area_1_humidity",
                "grow_area_1_vpd"
            ]
        );
        assert_eq!(configs[0].name, "Tent A Temperature");
        assert_eq!(configs[0].unit_of_measurement.as_deref(), Some("°C"));
        assert_eq!(configs[2].device_class, None);
        assert!(configs.iter().all(|c| c.availability.is_some()));
    }

    #[test]
    fn plant_configs_have_no_availability() {
        let plant = &area().plants[0];
        let configs = plant_configs(plant, &Topics::default());
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].name, "Gelato Days in Phase");
        assert_eq!(configs[1].state_topic, "growflow/plant/5/days_in_phase");
        assert!(configs.iter().all(|c| c.availability.is_none()));
        assert_eq!(configs[0].device.model, "Plant");
        assert_eq!(configs[0].device.identifiers, vec!["plant_5".to_string()]);
    }

    #[test]
    fn payload_omits_absent_optionals() {
        let plant = &area().plants[0];
        let phase = &plant_configs(plant, &Topics::default())[0];
        let json: Value = serde_json::from_slice(&phase.to_payload().expect("payload")).expect("json");
        assert!(json.get("unit_of_measurement").is_none());
        assert!(json.get("device_class").is_none());
        assert!(json.get("availability").is_none());
        assert_eq!(json["device"]["manufacturer"], "GrowFlow");
        assert_eq!(json["device"]["sw_version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn availability_block_points_at_status_topic() {
        let topics = Topics::new("lab", "homeassistant");
        let config = &grow_area_configs(&area(), &topics)[1];
        let json: Value = serde_json::from_slice(&config.to_payload().expect("payload")).expect("json");
        assert_eq!(json["availability"]["topic"], "lab/status");
        assert_eq!(json["availability"]["payload_available"], "online");
        assert_eq!(json["availability"]["payload_not_available"], "offline");
        assert_eq!(json["device_class"], "humidity");
    }

    #[test]
    fn reannouncing_is_byte_identical() {
        let topics = Topics::default();
        let first: Vec<_> = directory_configs(&[area()], &topics)
            .iter()
            .map(|c| c.to_payload().expect("payload"))
            .collect();
        let second: Vec<_> = directory_configs(&[area()], &topics)
            .iter()
            .map(|c| c.to_payload().expect("payload"))
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
    }
}
