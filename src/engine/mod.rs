//! Frame analysis engines.
//!
//! An engine receives raw frames and produces structured [`AnalysisResult`]s.
//! `load()` is the only call whose failure aborts pipeline startup; a failure
//! from `infer()` affects a single frame and the pipeline keeps running.

pub mod pixel_delta;
pub mod scripted;
#[cfg(feature = "engine-tract")]
pub mod tract;

pub use pixel_delta::PixelDeltaEngine;
pub use scripted::{ScriptedEngine, ScriptedOutcome};
#[cfg(feature = "engine-tract")]
pub use tract::TractEngine;

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::frame::{AnalysisResult, Frame};

/// Capability boundary between the pipeline and an analysis implementation.
pub trait AnalysisEngine: Send {
    /// Engine identifier, used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Acquire model resources and validate parameters.
    ///
    /// Must be called before `infer`. This is the one engine error the
    /// pipeline treats as fatal at startup.
    fn load(&mut self) -> Result<()>;

    /// Analyze one frame.
    fn infer(&mut self, frame: &Frame) -> Result<AnalysisResult>;
}

impl std::fmt::Debug for dyn AnalysisEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AnalysisEngine({})", self.name())
    }
}

/// Engine selection and parameters, as resolved from configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Engine kind: "pixel-delta" or "tract".
    pub kind: String,
    /// ONNX model path, required by the tract engine.
    pub model_path: Option<PathBuf>,
    /// Anomaly threshold in (0, 1].
    pub threshold: f32,
    /// Expected frame width in pixels.
    pub width: u32,
    /// Expected frame height in pixels.
    pub height: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: "pixel-delta".to_string(),
            model_path: None,
            threshold: PixelDeltaEngine::DEFAULT_THRESHOLD,
            width: 640,
            height: 480,
        }
    }
}

/// Build the configured engine. The returned engine is not yet loaded.
pub fn build_engine(config: &EngineConfig) -> Result<Box<dyn AnalysisEngine>> {
    match config.kind.as_str() {
        "pixel-delta" => Ok(Box::new(PixelDeltaEngine::new(config.threshold))),
        #[cfg(feature = "engine-tract")]
        "tract" => {
            let Some(model_path) = &config.model_path else {
                bail!("engine 'tract' requires a model path");
            };
            Ok(Box::new(
                TractEngine::new(model_path, config.width, config.height)
                    .with_threshold(config.threshold),
            ))
        }
        #[cfg(not(feature = "engine-tract"))]
        "tract" => bail!("engine 'tract' requires the engine-tract feature"),
        other => bail!("unknown analysis engine '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_pixel_delta_by_default() {
        let engine = build_engine(&EngineConfig::default()).expect("engine");
        assert_eq!(engine.name(), "pixel-delta");
    }

    #[test]
    fn rejects_unknown_engine_kind() {
        let config = EngineConfig {
            kind: "quantum".to_string(),
            ..EngineConfig::default()
        };
        let err = build_engine(&config).unwrap_err();
        assert!(err.to_string().contains("quantum"));
    }
}
