//! Vigil Edge
//!
//! This crate implements a resilient monitoring pipeline for edge devices:
//! frames come in from one capture device, an analysis engine turns them
//! into structured results, and telemetry fans out to operators over MQTT.
//!
//! # Architecture
//!
//! The pipeline holds four guarantees by construction:
//!
//! 1. **Capture never gives up**: the frame producer absorbs device faults
//!    and disconnects, reopening with a fixed backoff until told to stop.
//! 2. **Per-frame failure isolation**: an inference failure marks one result
//!    and the loop moves on; only an engine that fails to load aborts start.
//! 3. **Best-effort telemetry**: broker loss silently drops previews and
//!    alerts; frame processing never blocks on the network.
//! 4. **Independent subscribers**: the fan-out bridge removes a dead
//!    subscriber without disturbing the others or the broker session.
//!
//! # Module Structure
//!
//! - `capture`: frame sources and the deadman producer loop
//! - `engine`: analysis engines (pixel-delta, scripted, optional tract)
//! - `pipeline`: lifecycle orchestration (start/stop, monitoring loop)
//! - `telemetry`: MQTT preview/alert/status publishing
//! - `bridge`: broker-to-subscriber fan-out
//! - `config`: vigild configuration loading
//! - `frame`: shared frame and result types

use anyhow::{anyhow, Result};
use std::sync::OnceLock;

pub mod bridge;
pub mod capture;
pub mod config;
pub mod engine;
pub mod frame;
pub mod pipeline;
pub mod telemetry;

pub use bridge::{
    BridgeConfig, BridgeHandle, Envelope, FanoutBridge, SubscriberConn, SubscriberRegistry,
    TcpSubscriber,
};
pub use capture::{CaptureConfig, CaptureStats, FaultPlan, FrameProducer, FrameSource, StreamState};
#[cfg(feature = "engine-tract")]
pub use engine::TractEngine;
pub use engine::{build_engine, AnalysisEngine, EngineConfig, PixelDeltaEngine, ScriptedEngine};
pub use frame::{AnalysisResult, AnomalyEvent, BoundingRegion, Frame};
pub use pipeline::{Pipeline, PipelineState};
pub use telemetry::{MqttTelemetry, TelemetryConfig, TelemetrySink};

/// A conforming source_id is a short local identifier, not a location or a
/// URL: lowercase alphanumerics plus `_` and `-`, at most 64 characters.
pub fn validate_source_id(source_id: &str) -> Result<()> {
    // Compile once for hot paths.
    static SOURCE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re =
        SOURCE_ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap());

    if !re.is_match(source_id) {
        return Err(anyhow!(
            "source_id must match ^[a-z0-9][a-z0-9_-]{{0,63}}$"
        ));
    }
    Ok(())
}
