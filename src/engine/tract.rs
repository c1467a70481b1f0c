#![cfg(feature = "engine-tract")]

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::engine::AnalysisEngine;
use crate::frame::{AnalysisResult, AnomalyEvent, Frame};

/// Tract-based engine for ONNX classification models.
///
/// Loads a local model file and runs inference on raw RGB frames. It does no
/// network I/O and reads nothing from disk beyond the model itself.
pub struct TractEngine {
    model_path: PathBuf,
    model: Option<SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>>,
    width: u32,
    height: u32,
    threshold: f32,
}

impl TractEngine {
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            model: None,
            width,
            height,
            threshold: 0.5,
        }
    }

    /// Override the default positive-class threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let (width, height) = frame
            .dimensions()
            .ok_or_else(|| anyhow!("frame carries no dimension metadata"))?;
        if width != self.width || height != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                width,
                height,
                self.width,
                self.height
            ));
        }

        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if frame.payload.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                frame.payload.len()
            ));
        }

        let pixels = &frame.payload;
        let width = width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, height as usize, width),
            |(_, channel, y, x)| {
                let idx = (y * width + x) * 3 + channel;
                pixels[idx] as f32 / 255.0
            },
        );

        Ok(input.into_tensor())
    }

    fn extract_score(&self, outputs: TVec<TValue>) -> Result<f32> {
        let output = outputs
            .get(0)
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let max_score = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        if max_score.is_finite() {
            Ok(max_score)
        } else {
            Ok(0.0)
        }
    }
}

impl AnalysisEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn load(&mut self) -> Result<()> {
        let model = tract_onnx::onnx()
            .model_for_path(&self.model_path)
            .with_context(|| {
                format!(
                    "failed to load ONNX model from {}",
                    self.model_path.display()
                )
            })?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, self.height as usize, self.width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        self.model = Some(model);
        Ok(())
    }

    fn infer(&mut self, frame: &Frame) -> Result<AnalysisResult> {
        let started = Instant::now();
        let input = self.build_input(frame)?;
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("tract engine not loaded"))?;
        let outputs = model.run(tvec!(input.into())).context("ONNX inference failed")?;
        let score = self.extract_score(outputs)?;

        let mut anomalies = Vec::new();
        if score >= self.threshold {
            anomalies.push(AnomalyEvent::new(
                "model-positive",
                score,
                format!(
                    "classifier score {:.3} at or above threshold {:.3}",
                    score, self.threshold
                ),
            ));
        }
        Ok(AnalysisResult::new(frame, started.elapsed(), anomalies)
            .with_metric("max_score", score as f64))
    }
}
