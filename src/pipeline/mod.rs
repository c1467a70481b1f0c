//! Pipeline orchestration.
//!
//! Wires one frame source, one analysis engine, and one telemetry sink into
//! a monitoring loop with a strict lifecycle:
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`
//!
//! Only an engine load failure aborts startup. Capture faults are absorbed
//! by the producer, per-frame inference failures are substituted with
//! error-marked results, and telemetry is fire-and-forget, so a running
//! pipeline leaves `Running` only through `stop()` or an internal fault that
//! triggers the same orderly teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::capture::{FrameProducer, FrameSource};
use crate::engine::AnalysisEngine;
use crate::frame::{AnalysisResult, Frame};
use crate::telemetry::TelemetrySink;

/// Bound on how long `stop()` waits for the background loop to finish.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
/// Poll granularity for state waits.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Interval between capture health log lines.
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle state of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct PipelineShared {
    source: Arc<FrameSource>,
    engine: Mutex<Box<dyn AnalysisEngine>>,
    telemetry: Mutex<Box<dyn TelemetrySink>>,
    state: Mutex<PipelineState>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to one monitoring pipeline.
///
/// All clones share the same lifecycle; any of them may start, stop, or
/// observe it, which is what the signal handler and tests rely on.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<PipelineShared>,
}

impl Pipeline {
    pub fn new(
        source: Arc<FrameSource>,
        engine: Box<dyn AnalysisEngine>,
        telemetry: Box<dyn TelemetrySink>,
    ) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                source,
                engine: Mutex::new(engine),
                telemetry: Mutex::new(telemetry),
                state: Mutex::new(PipelineState::Stopped),
                stop: Arc::new(AtomicBool::new(false)),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> PipelineState {
        *lock_ignore_poison(&self.shared.state)
    }

    pub fn source(&self) -> &Arc<FrameSource> {
        &self.shared.source
    }

    /// Start the pipeline.
    ///
    /// With `blocking` set, runs the monitoring loop on the calling thread
    /// and returns once the pipeline has stopped; otherwise the loop runs on
    /// a background thread and this returns after startup. Calling while not
    /// `Stopped` is a warned no-op. The only startup error is an engine that
    /// fails to load; a telemetry sink that cannot connect is reported and
    /// the pipeline runs without it.
    pub fn start(&self, blocking: bool) -> Result<()> {
        {
            let mut state = lock_ignore_poison(&self.shared.state);
            if *state != PipelineState::Stopped {
                log::warn!("pipeline start ignored: state is {:?}", *state);
                return Ok(());
            }
            *state = PipelineState::Starting;
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        log::info!("pipeline starting: source {}", self.shared.source.config().url);

        // Telemetry is best-effort; startup proceeds without it.
        if let Err(err) = lock_ignore_poison(&self.shared.telemetry).start() {
            log::warn!("telemetry start failed: {err:#}; continuing without telemetry");
        }

        // Engine load is the one fatal startup step.
        let loaded = self
            .shared
            .engine
            .lock()
            .map_err(|_| anyhow!("analysis engine lock poisoned"))
            .and_then(|mut engine| {
                engine.load().map(|()| engine.name()).map_err(
                    |err| err.context("analysis engine failed to load"),
                )
            });
        let engine_name = match loaded {
            Ok(name) => name,
            Err(err) => {
                lock_ignore_poison(&self.shared.telemetry).stop();
                *lock_ignore_poison(&self.shared.state) = PipelineState::Stopped;
                return Err(err);
            }
        };
        log::info!("analysis engine ready: {}", engine_name);

        // A stop() issued during startup wins over entering Running.
        let proceed = {
            let mut state = lock_ignore_poison(&self.shared.state);
            if *state == PipelineState::Starting {
                *state = PipelineState::Running;
                true
            } else {
                false
            }
        };
        if !proceed {
            log::info!("pipeline stopped during startup");
            teardown(&self.shared);
            return Ok(());
        }

        if blocking {
            run_loop(self.shared.clone());
            Ok(())
        } else {
            let shared = self.shared.clone();
            let handle = std::thread::spawn(move || run_loop(shared));
            *lock_ignore_poison(&self.shared.worker) = Some(handle);
            Ok(())
        }
    }

    /// Stop the pipeline and release its resources. Idempotent and safe to
    /// call from any thread, including the signal handler.
    ///
    /// When the loop runs on a background thread, waits up to a bounded
    /// timeout for it to finish; on timeout the pipeline is declared stopped
    /// anyway with resources already released.
    pub fn stop(&self) {
        {
            let mut state = lock_ignore_poison(&self.shared.state);
            match *state {
                PipelineState::Stopped => {
                    log::debug!("pipeline stop ignored: already stopped");
                    return;
                }
                PipelineState::Stopping => {
                    log::debug!("pipeline stop already in progress");
                    return;
                }
                _ => *state = PipelineState::Stopping,
            }
        }
        log::info!("pipeline stopping");
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.source.close();
        lock_ignore_poison(&self.shared.telemetry).stop();

        let worker = lock_ignore_poison(&self.shared.worker).take();
        if let Some(handle) = worker {
            let deadline = Instant::now() + STOP_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(POLL_INTERVAL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::warn!("pipeline loop thread panicked");
                }
            } else {
                log::warn!(
                    "pipeline loop did not acknowledge stop within {:?}; declaring it stopped",
                    STOP_TIMEOUT
                );
            }
            *lock_ignore_poison(&self.shared.state) = PipelineState::Stopped;
            log::info!("pipeline stopped");
        }
        // In blocking mode the loop thread performs the final transition
        // itself once it drains out.
    }

    /// Block until the pipeline reaches `Stopped`, up to `timeout`.
    pub fn wait_for_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.state() != PipelineState::Stopped {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Route interrupt and termination signals into `stop()`.
    ///
    /// Only the first call installs the process-wide handler; later calls
    /// are debug-logged no-ops.
    pub fn install_signal_handler(&self) {
        static SIGNAL_INSTALL: Once = Once::new();
        let mut installed = false;
        SIGNAL_INSTALL.call_once(|| {
            installed = true;
            let pipeline = self.clone();
            if let Err(err) = ctrlc::set_handler(move || {
                log::info!("shutdown signal received");
                pipeline.stop();
            }) {
                log::warn!("failed to install shutdown signal handler: {}", err);
            }
        });
        if !installed {
            log::debug!("shutdown signal handler already installed");
        }
    }
}

/// Monitoring loop: pull, analyze, publish. Runs until the producer reports
/// stop or the state leaves `Running`, then drives the shared teardown.
fn run_loop(shared: Arc<PipelineShared>) {
    log::info!(
        "pipeline running: monitoring {}",
        shared.source.config().source_id
    );
    let producer = FrameProducer::new(shared.source.clone(), shared.stop.clone());
    let mut last_health = Instant::now();
    for frame in producer {
        if *lock_ignore_poison(&shared.state) != PipelineState::Running {
            break;
        }
        if let Err(err) = process_frame(&shared, frame) {
            log::error!("pipeline iteration failed: {err:#}; stopping");
            break;
        }
        if last_health.elapsed() >= HEALTH_INTERVAL {
            let stats = shared.source.stats();
            log::info!(
                "capture health: state={:?} frames={} reconnects={}",
                shared.source.state(),
                stats.frames_captured,
                stats.reconnects
            );
            last_health = Instant::now();
        }
    }
    teardown(&shared);
}

fn process_frame(shared: &Arc<PipelineShared>, frame: Frame) -> Result<()> {
    let started = Instant::now();
    let result = {
        let mut engine = shared
            .engine
            .lock()
            .map_err(|_| anyhow!("analysis engine lock poisoned"))?;
        match engine.infer(&frame) {
            Ok(result) => result,
            Err(err) => {
                log::warn!("inference failed for frame {}: {err:#}", frame.sequence_id);
                AnalysisResult::inference_error(&frame, started.elapsed(), &err)
            }
        }
    };

    for anomaly in &result.anomalies {
        log::warn!(
            "anomaly [{}] on frame {} (confidence {:.2}): {}",
            anomaly.label,
            result.sequence_id,
            anomaly.confidence,
            anomaly.description
        );
    }
    log::debug!(
        "frame {} analyzed in {} ms",
        result.sequence_id,
        result.processing_latency_ms
    );

    let mut sink = lock_ignore_poison(&shared.telemetry);
    sink.publish_preview(&frame);
    sink.publish_alert(&result);
    Ok(())
}

/// Release resources and declare the pipeline stopped. Every step is
/// idempotent, so the external `stop()` and the loop exit path may both run
/// it in either order.
fn teardown(shared: &Arc<PipelineShared>) {
    shared.stop.store(true, Ordering::SeqCst);
    shared.source.close();
    lock_ignore_poison(&shared.telemetry).stop();
    let mut state = lock_ignore_poison(&shared.state);
    if *state != PipelineState::Stopped {
        *state = PipelineState::Stopped;
        log::info!("pipeline stopped");
    }
}

// Poisoning would mean a sibling thread panicked mid-update; teardown must
// still be able to run, so recover the guard instead of propagating.
fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureConfig;
    use crate::engine::ScriptedEngine;

    struct NullSink;

    impl TelemetrySink for NullSink {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn publish_preview(&mut self, _frame: &Frame) {}
        fn publish_alert(&mut self, _result: &AnalysisResult) {}
        fn stop(&mut self) {}
    }

    fn test_source() -> Arc<FrameSource> {
        let config = CaptureConfig {
            url: "stub://test".to_string(),
            source_id: "edge0".to_string(),
            target_fps: 0,
            width: 16,
            height: 8,
            open_retry: Duration::from_millis(5),
            fault_pause: Duration::from_millis(2),
        };
        Arc::new(FrameSource::new(config).expect("source"))
    }

    fn test_pipeline() -> Pipeline {
        Pipeline::new(
            test_source(),
            Box::new(ScriptedEngine::new()),
            Box::new(NullSink),
        )
    }

    #[test]
    fn runs_and_stops_through_the_lifecycle() {
        let pipeline = test_pipeline();
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        pipeline.start(false).expect("start");
        let deadline = Instant::now() + Duration::from_secs(5);
        while pipeline.state() != PipelineState::Running && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pipeline.state(), PipelineState::Running);

        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(
            pipeline.source().state(),
            crate::capture::StreamState::Disconnected
        );
    }

    #[test]
    fn second_start_is_a_noop() {
        let pipeline = test_pipeline();
        pipeline.start(false).expect("first start");
        pipeline.start(false).expect("second start is a warned no-op");
        pipeline.stop();
        assert!(pipeline.wait_for_stopped(Duration::from_secs(5)));
    }

    #[test]
    fn stop_before_start_is_a_noop() {
        let pipeline = test_pipeline();
        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn load_failure_keeps_pipeline_stopped() {
        let pipeline = Pipeline::new(
            test_source(),
            Box::new(ScriptedEngine::with_load_error("no accelerator")),
            Box::new(NullSink),
        );
        let err = pipeline.start(true).unwrap_err();
        assert!(err.to_string().contains("failed to load"));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }
}
