//! Pure topic and identifier derivation.
//!
//! Every discovery topic, state topic and `unique_id` is a function of
//! `(entity kind, entity id, facet)` plus the configured prefixes. Nothing
//! here touches the broker, which keeps re-announcement idempotent.

use std::fmt;

pub const DEFAULT_TOPIC_PREFIX: &str = "growflow";
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
/// Component segment of every discovery topic; GrowFlow only announces sensors.
pub const DISCOVERY_COMPONENT: &str = "sensor";
/// Node id segment of discovery topics, independent of the state prefix.
pub const DISCOVERY_NODE_ID: &str = "growflow";
pub const STATUS_TOPIC_SUFFIX: &str = "status";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    GrowArea,
    Plant,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GrowArea => "grow_area",
            Self::Plant => "plant",
        }
    }

    pub fn facets(&self) -> &'static [Facet] {
        match self {
            Self::GrowArea => &[Facet::Temperature, Facet::Humidity, Facet::Vpd],
            Self::Plant => &[Facet::Phase, Facet::DaysInPhase],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Facet {
    Temperature,
    Humidity,
    Vpd,
    Phase,
    DaysInPhase,
}

impl Facet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Vpd => "vpd",
            Self::Phase => "phase",
            Self::DaysInPhase => "days_in_phase",
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Temperature | Self::Humidity | Self::Vpd => EntityKind::GrowArea,
            Self::Phase | Self::DaysInPhase => EntityKind::Plant,
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<kind>_<id>`, used as the device identifier.
pub fn entity_id(kind: EntityKind, id: i64) -> String {
    format!("{}_{}", kind, id)
}

/// `<kind>_<id>_<facet>`, globally unique across announced facets.
pub fn unique_id(kind: EntityKind, id: i64, facet: Facet) -> String {
    format!("{}_{}_{}", kind, id, facet)
}

/// Topic layout for one deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    discovery_prefix: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_PREFIX, DEFAULT_DISCOVERY_PREFIX)
    }
}

impl Topics {
    pub fn new(prefix: &str, discovery_prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            discovery_prefix: discovery_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn status(&self) -> String {
        format!("{}/{}", self.prefix, STATUS_TOPIC_SUFFIX)
    }

    /// Panics in debug builds if `facet` does not belong to `kind`.
    pub fn state(&self, kind: EntityKind, id: i64, facet: Facet) -> String {
        debug_assert_eq!(facet.kind(), kind, "facet {} is not a {} facet", facet, kind);
        format!("{}/{}/{}/{}", self.prefix, kind, id, facet)
    }

    pub fn config(&self, unique_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.discovery_prefix, DISCOVERY_COMPONENT, DISCOVERY_NODE_ID, unique_id
        )
    }

    /// Discovery topics of every facet of one entity.
    pub fn entity_configs(&self, kind: EntityKind, id: i64) -> Vec<String> {
        kind.facets()
            .iter()
            .map(|facet| self.config(&unique_id(kind, id, *facet)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn unique_ids_are_stable_and_distinct() {
        let temp = unique_id(EntityKind::GrowArea, 1, Facet::Temperature);
        assert_eq!(temp, "grow_area_1_temperature");
        assert_eq!(temp, unique_id(EntityKind::GrowArea, 1, Facet::Temperature));
        assert_ne!(temp, unique_id(EntityKind::GrowArea, 1, Facet::Humidity));

        let mut seen = HashSet::new();
        for id in 1..=20 {
            for kind in [EntityKind::GrowArea, EntityKind::Plant] {
                for facet in kind.facets() {
                    assert!(seen.insert(unique_id(kind, id, *facet)));
                }
            }
        }
        assert_eq!(seen.len(), 20 * 5);
    }

    #[test]
    fn plant_and_area_with_same_id_do_not_collide() {
        assert_ne!(entity_id(EntityKind::GrowArea, 4), entity_id(EntityKind::Plant, 4));
        assert_eq!(
            unique_id(EntityKind::Plant, 4, Facet::DaysInPhase),
            "plant_4_days_in_phase"
        );
    }

    #[test]
    fn topic_layout_matches_home_assistant_convention() {
        let topics = Topics::default();
        assert_eq!(topics.status(), "growflow/status");
        assert_eq!(
            topics.state(EntityKind::GrowArea, 2, Facet::Vpd),
            "growflow/grow_area/2/vpd"
        );
        assert_eq!(
            topics.config("plant_9_phase"),
            "homeassistant/sensor/growflow/plant_9_phase/config"
        );
    }

    #[test]
    fn custom_prefix_only_changes_state_topics() {
        let topics = Topics::new("tent/", "ha");
        assert_eq!(topics.status(), "tent/status");
        assert_eq!(
            topics.state(EntityKind::Plant, 1, Facet::Phase),
            "tent/plant/1/phase"
        );
        assert_eq!(
            topics.config("plant_1_phase"),
            "ha/sensor/growflow/plant_1_phase/config"
        );
    }

    #[test]
    fn facets_belong_to_their_kind() {
        for kind in [EntityKind::GrowArea, EntityKind::Plant] {
            for facet in kind.facets() {
                assert_eq!(facet.kind(), kind);
            }
        }
        assert_eq!(Topics::default().entity_configs(EntityKind::GrowArea, 3).len(), 3);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not a plant facet")]
    fn state_rejects_facet_of_other_kind() {
        Topics::default().state(EntityKind::Plant, 1, Facet::Temperature);
    }
}
