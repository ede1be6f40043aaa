//! Broker session owner and publisher.
//!
//! `MqttService` holds at most one broker session. It is built by the
//! application's composition root and shared by cloning the handle. Every
//! publish is a best-effort notification: failures are logged and never
//! returned to the caller.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;

use super::discovery::{directory_configs, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use super::topics::{EntityKind, Facet, Topics};
use crate::config::{GrowflowConfig, MqttSettings};
use crate::directory::EntityDirectory;
use crate::models::Plant;
use crate::transport::{BrokerLink, Connector, MqttEndpoint, SessionEvents, SessionOptions};

pub const CLIENT_ID_PREFIX: &str = "growflow";
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Payload of the app status topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppStatus {
    Online,
    Offline,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => PAYLOAD_ONLINE,
            Self::Offline => PAYLOAD_OFFLINE,
        }
    }
}

/// Latest environment values for a grow area. Absent fields are not published.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GrowAreaReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub vpd: Option<f64>,
}

/// Latest phase data for a plant. An empty phase counts as absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlantReading {
    pub phase: Option<String>,
    pub days_in_phase: Option<u64>,
}

impl PlantReading {
    pub fn from_plant(plant: &Plant, now_s: u64) -> Self {
        Self {
            phase: plant.current_phase().map(str::to_string),
            days_in_phase: plant.days_in_phase(now_s),
        }
    }
}

/// The single outbound session. Dropped on `disconnect`.
struct BrokerSession {
    generation: u64,
    client_id: String,
    state: ConnectionState,
    last_error: Option<String>,
    /// Configs published by the announce pass of the current connection.
    announced: Option<usize>,
    link: Arc<dyn BrokerLink>,
}

struct Shared {
    settings: MqttSettings,
    endpoint: MqttEndpoint,
    offline: bool,
    topics: Topics,
    directory: Arc<dyn EntityDirectory>,
    connector: Arc<dyn Connector>,
    session: Mutex<Option<BrokerSession>>,
    state_changed: Condvar,
    generation: AtomicU64,
    /// Held shared by every publishing call, exclusively by `disconnect`
    /// around the final `offline` status.
    publish_gate: RwLock<()>,
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Option<BrokerSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` to the session if it is still the one `generation`
    /// refers to. Returns the previous state on success.
    fn update_session(
        &self,
        generation: u64,
        update: impl FnOnce(&mut BrokerSession),
    ) -> Option<ConnectionState> {
        let mut guard = self.lock_session();
        let session = guard.as_mut().filter(|s| s.generation == generation)?;
        let previous = session.state;
        update(session);
        self.state_changed.notify_all();
        Some(previous)
    }
}

#[derive(Clone)]
pub struct MqttService {
    shared: Arc<Shared>,
}

impl MqttService {
    /// Fails only when the configured broker address cannot be parsed.
    pub fn new(
        config: &GrowflowConfig,
        directory: Arc<dyn EntityDirectory>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let endpoint = config.mqtt.endpoint()?;
        Ok(Self {
            shared: Arc::new(Shared {
                settings: config.mqtt.clone(),
                endpoint,
                offline: config.mqtt_offline(),
                topics: config.mqtt.topics(),
                directory,
                connector,
                session: Mutex::new(None),
                state_changed: Condvar::new(),
                generation: AtomicU64::new(0),
                publish_gate: RwLock::new(()),
            }),
        })
    }

    pub fn topics(&self) -> &Topics {
        &self.shared.topics
    }

    /// Open the broker session.
    ///
    /// Idempotent: returns at once while a session exists. In offline mode the
    /// session is skipped. Errors only for configuration problems such as
    /// unreadable TLS material; transport failures are retried in the
    /// background.
    pub fn connect(&self) -> Result<()> {
        let mut guard = self.shared.lock_session();
        if let Some(session) = guard.as_ref() {
            log::debug!(
                "MQTT session {} already {}, connect is a no-op",
                session.client_id,
                session.state
            );
            return Ok(());
        }

        if self.shared.offline {
            log::info!(
                "MQTT connection skipped in offline mode (broker {})",
                self.shared.endpoint.host
            );
            return Ok(());
        }

        let settings = &self.shared.settings;
        let tls = settings.tls_materials()?;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let client_id = format!("{}_{}", CLIENT_ID_PREFIX, crate::now_ms());
        let options = SessionOptions {
            endpoint: self.shared.endpoint.clone(),
            tls,
            client_id: client_id.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            keep_alive: settings.keep_alive,
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_interval: RECONNECT_INTERVAL,
            will_topic: self.shared.topics.status(),
            will_payload: PAYLOAD_OFFLINE.as_bytes().to_vec(),
        };
        let events = Arc::new(SessionHandler {
            shared: Arc::downgrade(&self.shared),
            generation,
        });

        let link = self.shared.connector.open(&options, events)?;
        log::info!(
            "Connecting to MQTT broker {}:{} as {} (TLS: {}, auth: {})",
            self.shared.endpoint.host,
            self.shared.endpoint.port,
            client_id,
            self.shared.endpoint.use_tls,
            settings.username.is_some()
        );
        *guard = Some(BrokerSession {
            generation,
            client_id,
            state: ConnectionState::Connecting,
            last_error: None,
            announced: None,
            link,
        });
        self.shared.state_changed.notify_all();
        Ok(())
    }

    /// Publish a retained `offline` status, close the transport and release
    /// the session. A no-op when there is no session.
    pub fn disconnect(&self) {
        let session = {
            let mut guard = self.shared.lock_session();
            let session = guard.take();
            self.shared.state_changed.notify_all();
            session
        };
        let Some(session) = session else {
            return;
        };

        // Wait out publishers that picked up the link before it was released.
        let _exclusive = self
            .shared
            .publish_gate
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        send(
            session.link.as_ref(),
            &self.shared.topics.status(),
            AppStatus::Offline.as_str().as_bytes(),
            true,
        );
        if let Err(e) = session.link.close() {
            log::warn!("MQTT close failed: {:#}", e);
        }
        log::info!("MQTT session {} closed", session.client_id);
    }

    /// Publish a retained status message. Only requires a live client object,
    /// so it may be attempted while the session is still connecting.
    pub fn publish_status(&self, status: AppStatus) -> bool {
        let _gate = self.publishing();
        self.send_status(status)
    }

    fn send_status(&self, status: AppStatus) -> bool {
        let Some(link) = self.live_link() else {
            return false;
        };
        send(
            link.as_ref(),
            &self.shared.topics.status(),
            status.as_str().as_bytes(),
            true,
        )
    }

    /// Announce every facet of the current directory with retained configs.
    ///
    /// Not incremental and never retracts. A directory-fetch failure aborts
    /// the pass before anything is published. Returns the number of configs
    /// handed to the transport.
    pub fn run_discovery(&self) -> usize {
        let _gate = self.publishing();
        self.discovery_pass()
    }

    fn discovery_pass(&self) -> usize {
        let Some(link) = self.connected_link() else {
            log::debug!("Skipping discovery: MQTT not connected");
            return 0;
        };

        let areas = match self.shared.directory.fetch_entity_directory() {
            Ok(areas) => areas,
            Err(e) => {
                log::error!("Auto-discovery setup failed: {:#}", e);
                return 0;
            }
        };

        let topics = &self.shared.topics;
        let configs = directory_configs(&areas, topics);
        let mut published = 0;
        for config in &configs {
            let payload = match config.to_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("Failed to encode discovery for {}: {:#}", config.unique_id, e);
                    continue;
                }
            };
            if send(link.as_ref(), &config.config_topic(topics), &payload, true) {
                published += 1;
            }
        }

        let plants: usize = areas.iter().map(|area| area.plants.len()).sum();
        log::info!(
            "Published HA discovery for {} grow areas and {} plants ({}/{} configs)",
            areas.len(),
            plants,
            published,
            configs.len()
        );
        published
    }

    /// Publish the given grow-area values, one non-retained message per
    /// present field.
    pub fn publish_grow_area_data(&self, grow_area_id: i64, reading: &GrowAreaReading) -> usize {
        let _gate = self.publishing();
        let Some(link) = self.connected_link() else {
            return 0;
        };
        let values = [
            (Facet::Temperature, reading.temperature.map(|v| v.to_string())),
            (Facet::Humidity, reading.humidity.map(|v| v.to_string())),
            (Facet::Vpd, reading.vpd.map(|v| format!("{:.2}", v))),
        ];
        self.publish_facets(link.as_ref(), EntityKind::GrowArea, grow_area_id, values)
    }

    pub fn publish_plant_data(&self, plant_id: i64, reading: &PlantReading) -> usize {
        let _gate = self.publishing();
        let Some(link) = self.connected_link() else {
            return 0;
        };
        let values = [
            (
                Facet::Phase,
                reading.phase.clone().filter(|phase| !phase.is_empty()),
            ),
            (
                Facet::DaysInPhase,
                reading.days_in_phase.map(|days| days.to_string()),
            ),
        ];
        self.publish_facets(link.as_ref(), EntityKind::Plant, plant_id, values)
    }

    /// Derive phase and days-in-phase from a plant record and publish them.
    pub fn publish_plant_snapshot(&self, plant: &Plant, now_s: u64) -> usize {
        self.publish_plant_data(plant.id, &PlantReading::from_plant(plant, now_s))
    }

    /// Delete a grow area's sensors from Home Assistant by clearing their
    /// retained configs.
    pub fn retract_grow_area(&self, grow_area_id: i64) -> usize {
        self.retract(EntityKind::GrowArea, grow_area_id)
    }

    pub fn retract_plant(&self, plant_id: i64) -> usize {
        self.retract(EntityKind::Plant, plant_id)
    }

    fn retract(&self, kind: EntityKind, id: i64) -> usize {
        let _gate = self.publishing();
        let Some(link) = self.connected_link() else {
            return 0;
        };
        let retracted = self
            .shared
            .topics
            .entity_configs(kind, id)
            .iter()
            .filter(|topic| send(link.as_ref(), topic, b"", true))
            .count();
        log::info!("Retracted {} discovery configs for {}_{}", retracted, kind, id);
        retracted
    }

    fn publish_facets<const N: usize>(
        &self,
        link: &dyn BrokerLink,
        kind: EntityKind,
        id: i64,
        values: [(Facet, Option<String>); N],
    ) -> usize {
        values
            .into_iter()
            .filter_map(|(facet, value)| value.map(|value| (facet, value)))
            .filter(|(facet, value)| {
                let topic = self.shared.topics.state(kind, id, *facet);
                send(link, &topic, value.as_bytes(), false)
            })
            .count()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared
            .lock_session()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn client_id(&self) -> Option<String> {
        self.shared.lock_session().as_ref().map(|s| s.client_id.clone())
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .lock_session()
            .as_ref()
            .and_then(|s| s.last_error.clone())
    }

    /// Block until the session is connected or `timeout` passes.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let guard = self.shared.lock_session();
        let (guard, _) = self
            .shared
            .state_changed
            .wait_timeout_while(guard, timeout, |session| {
                !matches!(session, Some(s) if s.state == ConnectionState::Connected)
            })
            .unwrap_or_else(PoisonError::into_inner);
        matches!(guard.as_ref(), Some(s) if s.state == ConnectionState::Connected)
    }

    /// Block until the announce pass that follows the current connection has
    /// finished, returning how many configs it published. `None` on timeout
    /// or when there is no session.
    pub fn wait_announced(&self, timeout: Duration) -> Option<usize> {
        let guard = self.shared.lock_session();
        let (guard, _) = self
            .shared
            .state_changed
            .wait_timeout_while(guard, timeout, |session| {
                matches!(session, Some(s) if s.announced.is_none())
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().and_then(|s| s.announced)
    }

    fn publishing(&self) -> RwLockReadGuard<'_, ()> {
        self.shared
            .publish_gate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn live_link(&self) -> Option<Arc<dyn BrokerLink>> {
        self.shared.lock_session().as_ref().map(|s| s.link.clone())
    }

    fn connected_link(&self) -> Option<Arc<dyn BrokerLink>> {
        self.shared
            .lock_session()
            .as_ref()
            .filter(|s| s.state == ConnectionState::Connected)
            .map(|s| s.link.clone())
    }

    fn is_current(&self, generation: u64) -> bool {
        matches!(self.shared.lock_session().as_ref(), Some(s) if s.generation == generation)
    }
}

fn send(link: &dyn BrokerLink, topic: &str, payload: &[u8], retain: bool) -> bool {
    match link.publish(topic, payload, retain) {
        Ok(()) => {
            log::debug!("MQTT publish {} ({} bytes, retain={})", topic, payload.len(), retain);
            true
        }
        Err(e) => {
            log::warn!("MQTT publish to {} failed: {:#}", topic, e);
            false
        }
    }
}

/// Routes transport events to the session they were opened for. Events from
/// a replaced or released session are ignored.
struct SessionHandler {
    shared: Weak<Shared>,
    generation: u64,
}

impl SessionHandler {
    fn service(&self) -> Option<MqttService> {
        self.shared
            .upgrade()
            .map(|shared| MqttService { shared })
    }
}

impl SessionEvents for SessionHandler {
    fn on_connected(&self) {
        let Some(service) = self.service() else {
            return;
        };
        let updated = service.shared.update_session(self.generation, |session| {
            session.state = ConnectionState::Connected;
            session.last_error = None;
            session.announced = None;
        });
        if updated.is_some() {
            log::info!("MQTT connected");
        }
    }

    fn on_ready(&self) {
        let Some(service) = self.service() else {
            return;
        };
        let _gate = service.publishing();
        if !service.is_current(self.generation) {
            return;
        }
        service.send_status(AppStatus::Online);
        let published = service.discovery_pass();
        service.shared.update_session(self.generation, |session| {
            session.announced = Some(published);
        });
    }

    fn on_error(&self, error: &str) {
        log::warn!("MQTT error: {}", error);
        if let Some(service) = self.service() {
            service.shared.update_session(self.generation, |session| {
                session.last_error = Some(error.to_string());
            });
        }
    }

    fn on_closed(&self) {
        let Some(service) = self.service() else {
            return;
        };
        let previous = service.shared.update_session(self.generation, |session| {
            session.state = ConnectionState::Disconnected;
        });
        if previous == Some(ConnectionState::Connected) {
            log::info!("MQTT disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;
    use crate::directory::InMemoryEntityDirectory;

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<(String, Vec<u8>, bool)>>,
    }

    impl BrokerLink for RecordingLink {
        fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec(), retain));
            Ok(())
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CapturingConnector {
        link: Arc<RecordingLink>,
        events: Mutex<Option<Arc<dyn SessionEvents>>>,
    }

    impl Connector for CapturingConnector {
        fn open(
            &self,
            _options: &SessionOptions,
            events: Arc<dyn SessionEvents>,
        ) -> Result<Arc<dyn BrokerLink>> {
            *self.events.lock().unwrap() = Some(events);
            Ok(self.link.clone())
        }
    }

    fn service(connector: Arc<CapturingConnector>) -> MqttService {
        let mut config = GrowflowConfig::default();
        config.mode = RunMode::Production;
        MqttService::new(
            &config,
            Arc::new(InMemoryEntityDirectory::default()),
            connector,
        )
        .expect("service")
    }

    fn events(connector: &CapturingConnector) -> Arc<dyn SessionEvents> {
        connector.events.lock().unwrap().clone().expect("session opened")
    }

    #[test]
    fn state_follows_session_events() {
        let connector = Arc::new(CapturingConnector::default());
        let svc = service(connector.clone());
        assert_eq!(svc.connection_state(), ConnectionState::Disconnected);

        svc.connect().unwrap();
        assert_eq!(svc.connection_state(), ConnectionState::Connecting);

        let events = events(&connector);
        events.on_connected();
        assert!(svc.is_connected());

        events.on_error("connection reset by peer");
        events.on_closed();
        assert_eq!(svc.connection_state(), ConnectionState::Disconnected);
        assert_eq!(svc.last_error().as_deref(), Some("connection reset by peer"));

        events.on_connected();
        assert!(svc.is_connected());
        assert_eq!(svc.last_error(), None);
    }

    #[test]
    fn stale_session_events_are_ignored() {
        let connector = Arc::new(CapturingConnector::default());
        let svc = service(connector.clone());
        svc.connect().unwrap();
        let stale = events(&connector);
        svc.disconnect();

        svc.connect().unwrap();
        stale.on_connected();
        assert_eq!(svc.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn publish_status_only_needs_a_client() {
        let connector = Arc::new(CapturingConnector::default());
        let svc = service(connector.clone());
        assert!(!svc.publish_status(AppStatus::Online));

        svc.connect().unwrap();
        assert!(svc.publish_status(AppStatus::Online));
        let sent = connector.link.sent.lock().unwrap();
        assert_eq!(sent[0], ("growflow/status".to_string(), b"online".to_vec(), true));
    }

    #[test]
    fn wait_connected_times_out_without_broker() {
        let connector = Arc::new(CapturingConnector::default());
        let svc = service(connector);
        svc.connect().unwrap();
        assert!(!svc.wait_connected(Duration::from_millis(20)));
    }

    #[test]
    fn client_id_is_time_derived() {
        let connector = Arc::new(CapturingConnector::default());
        let svc = service(connector);
        svc.connect().unwrap();
        let id = svc.client_id().expect("client id");
        let millis = id.strip_prefix("growflow_").expect("prefix");
        assert!(millis.parse::<u128>().is_ok());
    }

    #[test]
    fn plant_reading_from_plant_uses_active_phase() {
        let plant = Plant {
            id: 2,
            grow_area_id: 1,
            name: "Blue Dream".to_string(),
            strain: String::new(),
            is_active: true,
            phases: vec![crate::models::PlantPhase {
                name: "vegetation".to_string(),
                start_epoch_s: Some(0),
                duration_min: 21,
                duration_max: 42,
                is_active: true,
                is_completed: false,
            }],
        };
        let reading = PlantReading::from_plant(&plant, 86_400 * 3);
        assert_eq!(reading.phase.as_deref(), Some("vegetation"));
        assert_eq!(reading.days_in_phase, Some(3));
    }
}
