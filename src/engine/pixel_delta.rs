//! Scene-change engine based on mean absolute pixel delta.

use std::time::Instant;

use anyhow::{bail, Result};

use crate::engine::AnalysisEngine;
use crate::frame::{AnalysisResult, AnomalyEvent, Frame};

/// Compares each frame against the previous one and reports a `scene-change`
/// anomaly when the mean per-byte delta crosses the threshold.
///
/// Runs on the CPU with no model file. This is the default engine.
pub struct PixelDeltaEngine {
    threshold: f32,
    previous: Option<Vec<u8>>,
    loaded: bool,
}

impl PixelDeltaEngine {
    pub const DEFAULT_THRESHOLD: f32 = 0.25;

    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            previous: None,
            loaded: false,
        }
    }
}

impl Default for PixelDeltaEngine {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl AnalysisEngine for PixelDeltaEngine {
    fn name(&self) -> &'static str {
        "pixel-delta"
    }

    fn load(&mut self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            bail!(
                "scene-change threshold {} outside (0, 1]",
                self.threshold
            );
        }
        self.loaded = true;
        Ok(())
    }

    fn infer(&mut self, frame: &Frame) -> Result<AnalysisResult> {
        if !self.loaded {
            bail!("pixel-delta engine not loaded");
        }
        let started = Instant::now();
        let delta = match &self.previous {
            Some(previous) if previous.len() == frame.payload.len() => {
                mean_absolute_delta(previous, &frame.payload)
            }
            // Geometry changed mid-stream; treat as a full scene change.
            Some(_) => 1.0,
            None => 0.0,
        };
        let mut anomalies = Vec::new();
        if delta >= self.threshold {
            anomalies.push(AnomalyEvent::new(
                "scene-change",
                delta,
                format!(
                    "mean pixel delta {:.3} at or above threshold {:.3}",
                    delta, self.threshold
                ),
            ));
        }
        self.previous = Some(frame.payload.clone());
        Ok(AnalysisResult::new(frame, started.elapsed(), anomalies)
            .with_metric("mean_delta", delta as f64))
    }
}

/// Mean absolute byte difference, normalized to [0, 1].
fn mean_absolute_delta(previous: &[u8], current: &[u8]) -> f32 {
    if current.is_empty() {
        return 0.0;
    }
    let total: u64 = previous
        .iter()
        .zip(current)
        .map(|(a, b)| a.abs_diff(*b) as u64)
        .sum();
    total as f32 / (current.len() as f32 * 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence_id: u64, payload: Vec<u8>) -> Frame {
        Frame::new(sequence_id, "edge0", payload)
    }

    #[test]
    fn first_frame_is_never_anomalous() {
        let mut engine = PixelDeltaEngine::default();
        engine.load().expect("load");
        let result = engine.infer(&frame(1, vec![255; 48])).expect("infer");
        assert!(!result.has_anomalies());
        assert_eq!(result.metrics.get("mean_delta"), Some(&0.0));
    }

    #[test]
    fn large_delta_raises_scene_change() {
        let mut engine = PixelDeltaEngine::new(0.5);
        engine.load().expect("load");
        engine.infer(&frame(1, vec![0; 48])).expect("first");
        let result = engine.infer(&frame(2, vec![255; 48])).expect("second");
        assert!(result.has_anomalies());
        assert_eq!(result.anomalies[0].label, "scene-change");
        assert!((result.anomalies[0].confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn identical_frames_stay_quiet() {
        let mut engine = PixelDeltaEngine::new(0.1);
        engine.load().expect("load");
        engine.infer(&frame(1, vec![7; 48])).expect("first");
        let result = engine.infer(&frame(2, vec![7; 48])).expect("second");
        assert!(!result.has_anomalies());
    }

    #[test]
    fn payload_length_change_counts_as_full_delta() {
        let mut engine = PixelDeltaEngine::new(0.9);
        engine.load().expect("load");
        engine.infer(&frame(1, vec![7; 48])).expect("first");
        let result = engine.infer(&frame(2, vec![7; 96])).expect("second");
        assert!(result.has_anomalies());
    }

    #[test]
    fn load_rejects_bad_threshold() {
        let mut engine = PixelDeltaEngine::new(0.0);
        assert!(engine.load().is_err());
        let mut engine = PixelDeltaEngine::new(1.5);
        assert!(engine.load().is_err());
    }

    #[test]
    fn infer_before_load_fails() {
        let mut engine = PixelDeltaEngine::default();
        assert!(engine.infer(&frame(1, vec![0; 48])).is_err());
    }
}
