//! Scripted engine with queued outcomes.

use std::collections::VecDeque;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};

use crate::engine::AnalysisEngine;
use crate::frame::{AnalysisResult, AnomalyEvent, Frame};

/// Outcome the scripted engine returns for one `infer` call.
#[derive(Clone, Debug)]
pub enum ScriptedOutcome {
    /// A successful result carrying these anomalies.
    Anomalies(Vec<AnomalyEvent>),
    /// A per-frame inference failure with this message.
    Failure(String),
}

/// Engine that replays queued outcomes in order, then stays quiet.
///
/// Used by tests and dry runs to drive the pipeline deterministically
/// without a model.
#[derive(Default)]
pub struct ScriptedEngine {
    outcomes: VecDeque<ScriptedOutcome>,
    load_error: Option<String>,
    loaded: bool,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose `load` fails with this message.
    pub fn with_load_error(message: impl Into<String>) -> Self {
        Self {
            load_error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn push(&mut self, outcome: ScriptedOutcome) {
        self.outcomes.push_back(outcome);
    }

    /// Queue a successful result with no anomalies.
    pub fn push_quiet(&mut self) {
        self.push(ScriptedOutcome::Anomalies(Vec::new()));
    }

    pub fn push_anomalies(&mut self, anomalies: Vec<AnomalyEvent>) {
        self.push(ScriptedOutcome::Anomalies(anomalies));
    }

    pub fn push_failure(&mut self, message: impl Into<String>) {
        self.push(ScriptedOutcome::Failure(message.into()));
    }
}

impl AnalysisEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn load(&mut self) -> Result<()> {
        if let Some(message) = &self.load_error {
            bail!("{message}");
        }
        self.loaded = true;
        Ok(())
    }

    fn infer(&mut self, frame: &Frame) -> Result<AnalysisResult> {
        if !self.loaded {
            bail!("scripted engine not loaded");
        }
        let started = Instant::now();
        match self.outcomes.pop_front() {
            Some(ScriptedOutcome::Anomalies(anomalies)) => {
                Ok(AnalysisResult::new(frame, started.elapsed(), anomalies))
            }
            Some(ScriptedOutcome::Failure(message)) => Err(anyhow!(message)),
            None => Ok(AnalysisResult::new(frame, started.elapsed(), Vec::new())),
        }
    }
}
