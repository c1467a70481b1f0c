//! Best-effort telemetry publishing.
//!
//! The pipeline pushes previews and alerts through a [`TelemetrySink`]. The
//! MQTT implementation is strictly best-effort: publishes while disconnected
//! are dropped, transport failures are logged and swallowed, and nothing in
//! this module ever blocks frame processing on broker availability.

pub mod endpoint;
pub mod preview;

pub use endpoint::{parse_broker_endpoint, BrokerEndpoint};
pub use preview::compress_preview;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};

use crate::frame::{AnalysisResult, Frame};

/// Subtopic for downscaled preview frames (QoS 0).
pub const PREVIEW_SUBTOPIC: &str = "preview";
/// Subtopic for anomaly alerts (QoS 1).
pub const ALERT_SUBTOPIC: &str = "alert";
/// Subtopic for retained availability state.
pub const STATUS_SUBTOPIC: &str = "status";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Pause between connection error cycles in the drain thread.
const ERROR_PAUSE: Duration = Duration::from_secs(1);
/// Poll granularity for stop-aware sleeps.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sink the pipeline publishes through.
///
/// Implementations must never propagate transport failures back into frame
/// processing; `publish_preview` and `publish_alert` log and swallow.
pub trait TelemetrySink: Send {
    /// Begin connecting. Failure here is reported but the pipeline still
    /// enters `Running` without telemetry.
    fn start(&mut self) -> Result<()>;

    /// Publish a preview of this frame. Best-effort, lossy.
    fn publish_preview(&mut self, frame: &Frame);

    /// Publish an alert for this result. Skipped when the result carries no
    /// anomalies.
    fn publish_alert(&mut self, result: &AnalysisResult);

    /// Disconnect and release transport resources. Idempotent.
    fn stop(&mut self);
}

/// Configuration for the MQTT publisher.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Broker address, `host:port` with an optional `mqtt://` scheme.
    pub broker_addr: String,
    /// MQTT client identifier.
    pub client_id: String,
    /// Topic prefix; channels publish to `<prefix>/preview` and friends.
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Maximum preview width in pixels; 0 disables downscaling.
    pub preview_max_width: u32,
    /// Preview JPEG quality, 1..=100.
    pub jpeg_quality: u8,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            broker_addr: "127.0.0.1:1883".to_string(),
            client_id: "vigild".to_string(),
            topic_prefix: "telemetry".to_string(),
            username: None,
            password: None,
            preview_max_width: 640,
            jpeg_quality: 70,
        }
    }
}

/// MQTT telemetry publisher.
///
/// Owns a background drain thread that services the connection, tracks
/// broker availability, and republishes the retained `status` payload on
/// every (re)connect. The broker going away flips the publisher into a
/// silent drop-everything mode until the connection recovers.
pub struct MqttTelemetry {
    config: TelemetryConfig,
    endpoint: BrokerEndpoint,
    runtime: Option<MqttRuntime>,
    connected: Arc<AtomicBool>,
}

impl MqttTelemetry {
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        let endpoint = parse_broker_endpoint(&config.broker_addr)?;
        Ok(Self {
            config,
            endpoint,
            runtime: None,
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    /// True while the drain thread holds an acknowledged broker session.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn preview_topic(&self) -> String {
        format!("{}/{}", self.config.topic_prefix, PREVIEW_SUBTOPIC)
    }

    pub fn alert_topic(&self) -> String {
        format!("{}/{}", self.config.topic_prefix, ALERT_SUBTOPIC)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/{}", self.config.topic_prefix, STATUS_SUBTOPIC)
    }
}

impl TelemetrySink for MqttTelemetry {
    fn start(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            log::debug!("telemetry publisher already started");
            return Ok(());
        }

        let mut options =
            MqttOptions::new(&self.config.client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = &self.config.username {
            options.set_credentials(user, self.config.password.clone().unwrap_or_default());
        }
        let will = rumqttc::v5::mqttbytes::v5::LastWill::new(
            self.status_topic().as_str(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        );
        options.set_last_will(will);

        let (client, connection) = Client::new(options, 10);
        self.runtime = Some(MqttRuntime::spawn(
            client,
            connection,
            self.connected.clone(),
            self.status_topic(),
        ));
        log::info!(
            "telemetry publisher started: broker {}:{}, prefix '{}'",
            self.endpoint.host,
            self.endpoint.port,
            self.config.topic_prefix
        );
        Ok(())
    }

    fn publish_preview(&mut self, frame: &Frame) {
        if !self.is_connected() {
            return;
        }
        let Some(runtime) = &self.runtime else {
            return;
        };
        let payload = match compress_preview(
            frame,
            self.config.preview_max_width,
            self.config.jpeg_quality,
        ) {
            Ok(Some(jpeg)) => jpeg,
            Ok(None) => frame.payload.clone(),
            Err(err) => {
                log::debug!(
                    "preview compression failed for frame {}: {err:#}",
                    frame.sequence_id
                );
                return;
            }
        };
        let topic = self.preview_topic();
        if let Err(err) = runtime.client.publish(&topic, QoS::AtMostOnce, false, payload) {
            log::debug!("preview publish failed for frame {}: {}", frame.sequence_id, err);
        }
    }

    fn publish_alert(&mut self, result: &AnalysisResult) {
        if !result.has_anomalies() {
            return;
        }
        if !self.is_connected() {
            log::debug!(
                "dropping alert for frame {}: broker disconnected",
                result.sequence_id
            );
            return;
        }
        let Some(runtime) = &self.runtime else {
            return;
        };
        let payload = match serde_json::to_vec(result) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("alert serialization failed for frame {}: {}", result.sequence_id, err);
                return;
            }
        };
        let topic = self.alert_topic();
        if let Err(err) = runtime.client.publish(&topic, QoS::AtLeastOnce, false, payload) {
            log::warn!("alert publish failed for frame {}: {}", result.sequence_id, err);
        } else {
            log::info!(
                "alert published for frame {} ({} anomalies)",
                result.sequence_id,
                result.anomalies.len()
            );
        }
    }

    fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            log::debug!("telemetry publisher already stopped");
            return;
        };
        if self.is_connected() {
            let topic = self.status_topic();
            if let Err(err) = runtime.client.publish(
                &topic,
                QoS::AtLeastOnce,
                true,
                PAYLOAD_OFFLINE.as_bytes().to_vec(),
            ) {
                log::debug!("offline status publish failed: {}", err);
            }
        }
        runtime.shutdown();
        self.connected.store(false, Ordering::SeqCst);
        log::info!("telemetry publisher stopped");
    }
}

impl Drop for MqttTelemetry {
    fn drop(&mut self) {
        self.stop();
    }
}

struct MqttRuntime {
    client: Client,
    stop: Arc<AtomicBool>,
    drain: Option<JoinHandle<()>>,
}

impl MqttRuntime {
    /// Spawn the connection drain thread.
    ///
    /// The rumqttc connection iterator redials on its own; the thread keeps
    /// iterating across errors, flips the shared connected flag on ConnAck
    /// and loss, and republishes the retained online status after every
    /// successful (re)connect.
    fn spawn(
        client: Client,
        mut connection: Connection,
        connected: Arc<AtomicBool>,
        status_topic: String,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_client = client.clone();
        let drain = std::thread::spawn(move || {
            for event in connection.iter() {
                if thread_stop.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        log::info!("telemetry broker connected");
                        if let Err(err) = thread_client.publish(
                            &status_topic,
                            QoS::AtLeastOnce,
                            true,
                            PAYLOAD_ONLINE.as_bytes().to_vec(),
                        ) {
                            log::warn!("online status publish failed: {}", err);
                        }
                    }
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(err) => {
                        if connected.swap(false, Ordering::SeqCst) {
                            log::warn!("telemetry broker connection lost: {}", err);
                        } else {
                            log::debug!("telemetry broker unreachable: {}", err);
                        }
                        if !pause_unless_stopped(&thread_stop, ERROR_PAUSE) {
                            break;
                        }
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });
        Self {
            client,
            stop,
            drain: Some(drain),
        }
    }

    fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(err) = self.client.disconnect() {
            log::debug!("mqtt disconnect request failed: {}", err);
        }
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }
    }
}

/// Sleep in short slices so shutdown interrupts the pause. Returns false
/// when stopped.
fn pause_unless_stopped(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let slice = POLL_INTERVAL.min(remaining);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    !stop.load(Ordering::SeqCst)
}
