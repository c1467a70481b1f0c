//! Pipeline data model.
//!
//! - `Frame`: one captured sample with a monotonic per-source sequence id.
//! - `AnomalyEvent`: a single detection produced by the analysis engine.
//! - `AnalysisResult`: the structured output of analyzing one frame.
//!
//! Frames are created by the capture layer and owned by the orchestrator for
//! one pipeline iteration; results are immutable once constructed and
//! serialize to the alert wire format.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Metadata key for the frame width in pixels.
pub const META_WIDTH: &str = "width";
/// Metadata key for the frame height in pixels.
pub const META_HEIGHT: &str = "height";
/// Metadata key for the payload pixel format.
pub const META_PIXEL_FORMAT: &str = "pixel_format";
/// Pixel format value for packed 8-bit RGB payloads.
pub const PIXEL_FORMAT_RGB8: &str = "rgb8";

/// One captured sensory sample.
///
/// `sequence_id` is strictly increasing per source for the lifetime of one
/// `FrameSource`, including across reconnects.
#[derive(Debug, Clone)]
pub struct Frame {
    pub capture_time: SystemTime,
    pub sequence_id: u64,
    pub source_id: String,
    /// Opaque image buffer. The pipeline never interprets these bytes;
    /// consumers that need structure read the metadata map.
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

impl Frame {
    pub fn new(sequence_id: u64, source_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            capture_time: SystemTime::now(),
            sequence_id,
            source_id: source_id.into(),
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Pixel dimensions, when the capture backend recorded them.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let width = self.metadata.get(META_WIDTH)?.parse().ok()?;
        let height = self.metadata.get(META_HEIGHT)?.parse().ok()?;
        Some((width, height))
    }
}

/// Rectangular region of a frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A single detected anomaly. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub label: String,
    /// Confidence in [0, 1]; clamped at construction.
    pub confidence: f32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<BoundingRegion>,
}

impl AnomalyEvent {
    pub fn new(label: impl Into<String>, confidence: f32, description: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            description: description.into(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: BoundingRegion) -> Self {
        self.region = Some(region);
        self
    }
}

/// Structured output of analyzing one frame. Produced exactly once per
/// processed frame; never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub sequence_id: u64,
    pub source_id: String,
    /// Wall-clock capture time, milliseconds since the Unix epoch.
    pub capture_time_ms: u64,
    /// Capture-to-report processing latency in milliseconds.
    pub processing_latency_ms: u64,
    pub anomalies: Vec<AnomalyEvent>,
    /// Engine-specific output, or an error marker when inference failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
}

impl AnalysisResult {
    pub fn new(frame: &Frame, latency: Duration, anomalies: Vec<AnomalyEvent>) -> Self {
        Self {
            sequence_id: frame.sequence_id,
            source_id: frame.source_id.clone(),
            capture_time_ms: epoch_millis(frame.capture_time),
            processing_latency_ms: latency.as_millis() as u64,
            anomalies,
            raw_output: None,
            metrics: HashMap::new(),
        }
    }

    /// Substitute result for a frame whose inference failed: no anomalies,
    /// the failure recorded in `raw_output`.
    pub fn inference_error(frame: &Frame, latency: Duration, err: &anyhow::Error) -> Self {
        let mut result = Self::new(frame, latency, Vec::new());
        result.raw_output = Some(serde_json::json!({ "error": format!("{err:#}") }));
        result
    }

    pub fn with_raw_output(mut self, raw: serde_json::Value) -> Self {
        self.raw_output = Some(raw);
        self
    }

    pub fn with_metric(mut self, key: &str, value: f64) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    pub fn has_anomalies(&self) -> bool {
        !self.anomalies.is_empty()
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch times.
pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
