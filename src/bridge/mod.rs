//! Telemetry fan-out bridge.
//!
//! Subscribes to the pipeline's telemetry topics on the broker and
//! rebroadcasts every preview and alert to all live subscriber connections.
//! Subscribers attach over plain TCP and receive one JSON envelope per line;
//! each subscriber fails independently and a dead one never affects the
//! others or the broker session.

pub mod envelope;
pub mod registry;

pub use envelope::Envelope;
pub use registry::{SubscriberConn, SubscriberRegistry, TcpSubscriber};

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};

use crate::telemetry::{parse_broker_endpoint, BrokerEndpoint};

/// Pause between broker connection error cycles.
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
/// Poll granularity for accept loops and stop-aware sleeps.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Read timeout on subscriber keep-alive drains.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Bridge configuration.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Broker address, `host:port` with an optional `mqtt://` scheme.
    pub broker_addr: String,
    /// MQTT client identifier.
    pub client_id: String,
    /// Telemetry topic prefix to subscribe under.
    pub topic_prefix: String,
    /// Address the subscriber listener binds to.
    pub listen_addr: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker_addr: "127.0.0.1:1883".to_string(),
            client_id: "fanout_bridge".to_string(),
            topic_prefix: "telemetry".to_string(),
            listen_addr: "127.0.0.1:8750".to_string(),
            username: None,
            password: None,
        }
    }
}

/// Running bridge, stopped through [`BridgeHandle::stop`].
pub struct BridgeHandle {
    /// Address the subscriber listener actually bound to.
    pub addr: SocketAddr,
    registry: Arc<SubscriberRegistry>,
    shutdown: Arc<AtomicBool>,
    client: Client,
    broker_join: Option<JoinHandle<()>>,
    listener_join: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Number of currently registered live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Deliver one envelope to every live subscriber without going through
    /// the broker. Returns the number of successful deliveries.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        self.registry.broadcast(envelope)
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(err) = self.client.disconnect() {
            log::debug!("bridge mqtt disconnect request failed: {}", err);
        }
        if let Some(join) = self.broker_join.take() {
            join.join()
                .map_err(|_| anyhow!("bridge broker thread panicked"))?;
        }
        if let Some(join) = self.listener_join.take() {
            join.join()
                .map_err(|_| anyhow!("bridge listener thread panicked"))?;
        }
        Ok(())
    }
}

/// Fan-out bridge between the broker's telemetry topics and live TCP
/// subscribers.
pub struct FanoutBridge {
    config: BridgeConfig,
}

impl FanoutBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Start the broker and listener threads.
    pub fn spawn(self) -> Result<BridgeHandle> {
        let endpoint = parse_broker_endpoint(&self.config.broker_addr)?;
        let listener = TcpListener::bind(&self.config.listen_addr)
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let registry = Arc::new(SubscriberRegistry::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let (client, connection) = build_client(&self.config, &endpoint);
        let broker_registry = registry.clone();
        let broker_shutdown = shutdown.clone();
        let broker_client = client.clone();
        let prefix = self.config.topic_prefix.clone();
        let broker_join = std::thread::spawn(move || {
            run_broker(
                connection,
                broker_client,
                broker_registry,
                broker_shutdown,
                prefix,
            );
        });

        let listener_registry = registry.clone();
        let listener_shutdown = shutdown.clone();
        let listener_join = std::thread::spawn(move || {
            run_listener(listener, listener_registry, listener_shutdown);
        });

        log::info!(
            "fan-out bridge started: broker {}:{}, subscribers on {}",
            endpoint.host,
            endpoint.port,
            addr
        );
        Ok(BridgeHandle {
            addr,
            registry,
            shutdown,
            client,
            broker_join: Some(broker_join),
            listener_join: Some(listener_join),
        })
    }
}

fn build_client(config: &BridgeConfig, endpoint: &BrokerEndpoint) -> (Client, Connection) {
    let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    if let Some(user) = &config.username {
        options.set_credentials(user, config.password.clone().unwrap_or_default());
    }
    Client::new(options, 10)
}

/// Drain the broker connection, resubscribing on every (re)connect and
/// rebroadcasting each telemetry publish to the registry.
fn run_broker(
    mut connection: Connection,
    client: Client,
    registry: Arc<SubscriberRegistry>,
    shutdown: Arc<AtomicBool>,
    prefix: String,
) {
    let wildcard = format!("{}/#", prefix);
    for event in connection.iter() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                log::info!("bridge connected to broker; subscribing to {}", wildcard);
                if let Err(err) = client.subscribe(&wildcard, QoS::AtMostOnce) {
                    log::warn!("bridge subscribe failed: {}", err);
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let topic = match std::str::from_utf8(&publish.topic) {
                    Ok(topic) => topic,
                    Err(err) => {
                        log::warn!("skipping publish with invalid topic: {}", err);
                        continue;
                    }
                };
                match Envelope::from_broker(topic, &prefix, &publish.payload) {
                    Ok(Some(envelope)) => {
                        let delivered = registry.broadcast(&envelope);
                        log::debug!(
                            "rebroadcast message from {} to {} subscribers",
                            topic,
                            delivered
                        );
                    }
                    Ok(None) => {}
                    Err(err) => log::warn!("undeliverable message on {}: {err:#}", topic),
                }
            }
            Ok(_) => {}
            Err(err) => {
                log::warn!("bridge broker connection error: {}; retrying", err);
                if !pause_unless_stopped(&shutdown, RECONNECT_PAUSE) {
                    break;
                }
            }
        }
    }
    log::info!("bridge broker thread exiting");
}

/// Accept subscriber connections until shutdown.
fn run_listener(
    listener: TcpListener,
    registry: Arc<SubscriberRegistry>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = accept_subscriber(stream, &registry, &shutdown) {
                    log::warn!("subscriber setup failed for {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                log::error!("subscriber accept failed: {}", err);
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
    log::info!("bridge listener thread exiting");
}

fn accept_subscriber(
    stream: TcpStream,
    registry: &Arc<SubscriberRegistry>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let reader = stream.try_clone().context("failed to clone subscriber stream")?;
    let subscriber = TcpSubscriber::new(stream).context("failed to configure subscriber stream")?;
    let id = registry.register(Box::new(subscriber));

    let registry = registry.clone();
    let shutdown = shutdown.clone();
    std::thread::spawn(move || drain_keepalive(reader, id, registry, shutdown));
    Ok(())
}

/// Discard client-to-server bytes and unregister the subscriber when its
/// connection closes or errors.
fn drain_keepalive(
    mut reader: TcpStream,
    id: u64,
    registry: Arc<SubscriberRegistry>,
    shutdown: Arc<AtomicBool>,
) {
    if reader.set_read_timeout(Some(DRAIN_TIMEOUT)).is_err() {
        registry.unregister(id);
        return;
    }
    let mut buf = [0u8; 256];
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                log::debug!("subscriber #{} closed its connection", id);
                registry.unregister(id);
                break;
            }
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) => {
                log::debug!("subscriber #{} read failed: {}", id, err);
                registry.unregister(id);
                break;
            }
        }
    }
}

/// Sleep in short slices so shutdown interrupts the pause. Returns false
/// when stopped.
fn pause_unless_stopped(shutdown: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let slice = POLL_INTERVAL.min(remaining);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    !shutdown.load(Ordering::SeqCst)
}
