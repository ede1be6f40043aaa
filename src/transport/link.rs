//! Broker session seam.
//!
//! [`Connector`] opens one transport session and reports its lifecycle through
//! [`SessionEvents`]. [`BrokerLink`] is the publish side of an open session.
//! `RumqttcConnector` is the production implementation; tests plug in a stub
//! broker at the same seam.

use anyhow::{anyhow, Result};
use rumqttc::{
    Client, ClientError, Connection, ConnectionError, Event, Incoming, LastWill, MqttOptions,
    NetworkOptions, Outgoing, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use super::tls::{MqttEndpoint, TlsMaterials};

/// Bound on queued requests between publishers and the event loop thread.
const REQUEST_CAPACITY: usize = 64;

/// Everything needed to open one session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    /// Retained last-will message the broker publishes on unexpected loss.
    pub will_topic: String,
    pub will_payload: Vec<u8>,
}

/// Lifecycle callbacks from a transport session.
pub trait SessionEvents: Send + Sync {
    /// The broker accepted the session. Runs on the transport thread and must
    /// not publish.
    fn on_connected(&self);

    /// Follows every `on_connected`, off the transport thread. May publish.
    fn on_ready(&self);

    /// A transport error. The transport keeps retrying.
    fn on_error(&self, error: &str);

    /// The transport lost (or never reached) the broker.
    fn on_closed(&self);
}

/// Publish side of an open session. Publishes are handed to the transport
/// and never wait for broker acknowledgement.
pub trait BrokerLink: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

    /// Flush queued messages, send DISCONNECT and stop reconnecting.
    fn close(&self) -> Result<()>;
}

pub trait Connector: Send + Sync {
    fn open(
        &self,
        options: &SessionOptions,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Arc<dyn BrokerLink>>;
}

/// Opens sessions with the rumqttc sync client, one event loop thread each.
#[derive(Clone, Copy, Debug, Default)]
pub struct RumqttcConnector;

impl Connector for RumqttcConnector {
    fn open(
        &self,
        options: &SessionOptions,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Arc<dyn BrokerLink>> {
        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            options.endpoint.host.clone(),
            options.endpoint.port,
        );
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(true);
        if let Some(user) = &options.username {
            mqtt_options.set_credentials(user, options.password.as_deref().unwrap_or_default());
        }
        mqtt_options.set_last_will(LastWill::new(
            options.will_topic.clone(),
            options.will_payload.clone(),
            QoS::AtLeastOnce,
            true,
        ));
        mqtt_options.set_transport(options.endpoint.build_transport(&options.tls)?);

        let (client, mut connection) = Client::new(mqtt_options, REQUEST_CAPACITY);
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(options.connect_timeout.as_secs());
        connection.eventloop.set_network_options(network);

        let shutdown = Arc::new(AtomicBool::new(false));
        let loop_shutdown = shutdown.clone();
        let reconnect_interval = options.reconnect_interval;
        let handle = std::thread::Builder::new()
            .name("growflow-mqtt".to_string())
            .spawn(move || run_event_loop(connection, events, loop_shutdown, reconnect_interval))?;

        Ok(Arc::new(RumqttcLink {
            client,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }))
    }
}

fn run_event_loop(
    mut connection: Connection,
    events: Arc<dyn SessionEvents>,
    shutdown: Arc<AtomicBool>,
    reconnect_interval: Duration,
) {
    for notification in connection.iter() {
        if dispatch(notification, &events, &shutdown, reconnect_interval) == LoopControl::Stop {
            break;
        }
    }
    events.on_closed();
}

#[derive(Debug, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Stop,
}

/// Route one event-loop notification to the session callbacks.
fn dispatch(
    notification: Result<Event, ConnectionError>,
    events: &Arc<dyn SessionEvents>,
    shutdown: &AtomicBool,
    reconnect_interval: Duration,
) -> LoopControl {
    match notification {
        Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
            log::debug!("MQTT ConnAck: session_present={}", ack.session_present);
            events.on_connected();
            let ready = events.clone();
            let spawned = std::thread::Builder::new()
                .name("growflow-discovery".to_string())
                .spawn(move || ready.on_ready());
            if let Err(e) = spawned {
                log::error!("failed to start discovery thread: {}", e);
            }
            LoopControl::Continue
        }
        Ok(Event::Outgoing(Outgoing::Disconnect)) => LoopControl::Stop,
        Ok(_) => LoopControl::Continue,
        Err(e) => {
            if shutdown.load(Ordering::SeqCst) {
                return LoopControl::Stop;
            }
            events.on_error(&e.to_string());
            events.on_closed();
            // The next poll reconnects.
            std::thread::sleep(reconnect_interval);
            LoopControl::Continue
        }
    }
}

struct RumqttcLink {
    client: Client,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerLink for RumqttcLink {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        // Retained discovery/status messages get QoS 1; telemetry is best effort.
        let qos = if retain {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        };
        // Never block: the request queue does not drain while the broker is away.
        match self.client.try_publish(topic, qos, retain, payload.to_vec()) {
            Ok(()) => Ok(()),
            Err(ClientError::TryRequest(_)) => Err(anyhow!(
                "MQTT request queue full ({} pending), dropping publish",
                REQUEST_CAPACITY
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let result = self.client.disconnect();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode};
    use std::sync::mpsc::{self, Receiver, Sender};

    struct ChannelEvents(Mutex<Sender<String>>);

    impl ChannelEvents {
        fn record(&self, what: &str) {
            let _ = self.0.lock().unwrap().send(what.to_string());
        }
    }

    impl SessionEvents for ChannelEvents {
        fn on_connected(&self) {
            self.record("connected");
        }

        fn on_ready(&self) {
            self.record("ready");
        }

        fn on_error(&self, error: &str) {
            self.record(&format!("error: {}", error));
        }

        fn on_closed(&self) {
            self.record("closed");
        }
    }

    fn events() -> (Arc<dyn SessionEvents>, Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelEvents(Mutex::new(tx))), rx)
    }

    fn next(rx: &Receiver<String>) -> String {
        rx.recv_timeout(Duration::from_secs(5)).expect("session event")
    }

    fn refused() -> ConnectionError {
        ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))
    }

    #[test]
    fn connack_reports_connected_then_ready() {
        let (events, rx) = events();
        let shutdown = AtomicBool::new(false);
        let connack = Event::Incoming(Incoming::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));

        let control = dispatch(Ok(connack), &events, &shutdown, Duration::ZERO);
        assert_eq!(control, LoopControl::Continue);
        assert_eq!(next(&rx), "connected");
        assert_eq!(next(&rx), "ready");
    }

    #[test]
    fn error_reports_and_keeps_retrying() {
        let (events, rx) = events();
        let shutdown = AtomicBool::new(false);

        let control = dispatch(Err(refused()), &events, &shutdown, Duration::ZERO);
        assert_eq!(control, LoopControl::Continue);
        assert!(next(&rx).starts_with("error: "));
        assert_eq!(next(&rx), "closed");
    }

    #[test]
    fn error_after_shutdown_stops_silently() {
        let (events, rx) = events();
        let shutdown = AtomicBool::new(true);

        let control = dispatch(Err(refused()), &events, &shutdown, Duration::ZERO);
        assert_eq!(control, LoopControl::Stop);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn outgoing_disconnect_stops_the_loop() {
        let (events, rx) = events();
        let shutdown = AtomicBool::new(false);

        let control = dispatch(
            Ok(Event::Outgoing(Outgoing::Disconnect)),
            &events,
            &shutdown,
            Duration::ZERO,
        );
        assert_eq!(control, LoopControl::Stop);
        let control = dispatch(
            Ok(Event::Outgoing(Outgoing::PingReq)),
            &events,
            &shutdown,
            Duration::ZERO,
        );
        assert_eq!(control, LoopControl::Continue);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_on_full_queue_fails_without_blocking() {
        let options = MqttOptions::new("growflow_test", "localhost", 1883);
        // The connection is never polled, so nothing drains the queue.
        let (client, _connection) = Client::new(options, 1);
        let link = RumqttcLink {
            client,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        };

        link.publish("growflow/status", b"online", true)
            .expect("first publish fits the queue");
        let err = link
            .publish("growflow/status", b"offline", true)
            .unwrap_err();
        assert!(err.to_string().contains("queue full"));
    }
}
