//! Frame source and the deadman-switch producer loop.
//!
//! `FrameSource` wraps one capture device behind a mutex so `close()` is
//! idempotent and safe from any thread. `FrameProducer` turns a source into
//! an infinite iterator that reopens the device after every fault and only
//! terminates through its external stop flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};

use crate::frame::{Frame, META_HEIGHT, META_PIXEL_FORMAT, META_WIDTH, PIXEL_FORMAT_RGB8};

/// Poll granularity for stop-aware sleeps.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Connection state of one capture device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
}

/// Configuration for a frame source.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Capture URL (e.g., "stub://front_camera").
    pub url: String,
    /// Source identifier stamped on every frame.
    pub source_id: String,
    /// Target frame rate; 0 disables pacing.
    pub target_fps: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Wait between failed open attempts.
    pub open_retry: Duration,
    /// Pause after a mid-stream fault before reopening.
    pub fault_pause: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            url: "stub://edge_camera".to_string(),
            source_id: "edge0".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
            open_retry: Duration::from_secs(2),
            fault_pause: Duration::from_millis(500),
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Copy, Debug, Default)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub reconnects: u64,
}

/// Deterministic fault schedule for the synthetic backend.
///
/// Used by tests to exercise the reconnect paths without real hardware.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// Number of initial `open` attempts that fail.
    pub open_failures: u32,
    /// 1-based read ordinals (counted across reconnects) that return an
    /// empty payload.
    pub read_faults: Vec<u64>,
}

/// Frame source wrapping one capture device.
///
/// Holds the device handle exclusively for its lifetime. `sequence_id` is
/// strictly increasing per source and survives reconnects.
#[derive(Debug)]
pub struct FrameSource {
    config: CaptureConfig,
    device: Mutex<DeviceSlot>,
    sequence: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug)]
struct DeviceSlot {
    state: StreamState,
    backend: CaptureBackend,
    ever_connected: bool,
}

#[derive(Debug)]
enum CaptureBackend {
    Synthetic(SyntheticDevice),
}

impl FrameSource {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        let backend = if config.url.starts_with("stub://") {
            CaptureBackend::Synthetic(SyntheticDevice::new(&config))
        } else {
            let scheme = config.url.split("://").next().unwrap_or(&config.url);
            bail!("capture scheme '{}' requires a hardware backend", scheme)
        };
        Ok(Self {
            config,
            device: Mutex::new(DeviceSlot {
                state: StreamState::Disconnected,
                backend,
                ever_connected: false,
            }),
            sequence: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        })
    }

    /// Install a fault schedule on the synthetic backend. Test hook.
    pub fn with_fault_plan(mut self, plan: FaultPlan) -> Self {
        let slot = self
            .device
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &mut slot.backend {
            CaptureBackend::Synthetic(device) => device.plan = plan,
        }
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> StreamState {
        lock_device(&self.device).state
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.sequence.load(Ordering::SeqCst),
            reconnects: self.reconnects.load(Ordering::SeqCst),
        }
    }

    /// Open the capture device.
    ///
    /// Transitions `Disconnected -> Connecting -> Streaming`. On failure the
    /// state returns to `Disconnected` and the caller retries.
    pub fn open(&self) -> Result<()> {
        let mut slot = lock_device(&self.device);
        if slot.state == StreamState::Streaming {
            return Ok(());
        }
        slot.state = StreamState::Connecting;
        let opened = match &mut slot.backend {
            CaptureBackend::Synthetic(device) => device.open(),
        };
        match opened {
            Ok(()) => {
                slot.state = StreamState::Streaming;
                if slot.ever_connected {
                    self.reconnects.fetch_add(1, Ordering::SeqCst);
                    log::info!("capture source reconnected: {}", self.config.url);
                } else {
                    slot.ever_connected = true;
                    log::info!("capture source connected: {}", self.config.url);
                }
                Ok(())
            }
            Err(err) => {
                slot.state = StreamState::Disconnected;
                Err(err)
            }
        }
    }

    /// Capture the next frame. Valid only while `Streaming`.
    ///
    /// An empty payload from the device is reported as an error; the caller
    /// treats it as a stream fault and reopens.
    pub fn next_frame(&self) -> Result<Frame> {
        let mut slot = lock_device(&self.device);
        if slot.state != StreamState::Streaming {
            bail!("next_frame called in state {:?}", slot.state);
        }
        let payload = match &mut slot.backend {
            CaptureBackend::Synthetic(device) => device.read(),
        };
        if payload.is_empty() {
            return Err(anyhow!("capture read returned an empty payload"));
        }
        let sequence_id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(
            Frame::new(sequence_id, self.config.source_id.as_str(), payload)
                .with_metadata(META_WIDTH, self.config.width)
                .with_metadata(META_HEIGHT, self.config.height)
                .with_metadata(META_PIXEL_FORMAT, PIXEL_FORMAT_RGB8),
        )
    }

    /// Release the device handle. Idempotent, callable from any thread and
    /// from any state.
    pub fn close(&self) {
        let mut slot = lock_device(&self.device);
        match &mut slot.backend {
            CaptureBackend::Synthetic(device) => device.release(),
        }
        if slot.state != StreamState::Disconnected {
            slot.state = StreamState::Disconnected;
            log::info!("capture source released: {}", self.config.url);
        }
    }
}

// A poisoned lock here only means a reader panicked mid-call; the slot
// itself stays usable and close() must still succeed.
fn lock_device(device: &Mutex<DeviceSlot>) -> MutexGuard<'_, DeviceSlot> {
    device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Restartable, infinite frame iterator.
///
/// Whenever the source is not streaming, retries `open()` with a fixed
/// backoff; a failed read releases the device, pauses briefly, and reopens.
/// Capture failures never escape the iterator. Yields `None` only once the
/// stop flag is set, checked at every iteration boundary.
pub struct FrameProducer {
    source: Arc<FrameSource>,
    stop: Arc<AtomicBool>,
}

impl FrameProducer {
    pub fn new(source: Arc<FrameSource>, stop: Arc<AtomicBool>) -> Self {
        Self { source, stop }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep in short slices so a stop request interrupts the backoff.
    /// Returns false when stopped.
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

impl Iterator for FrameProducer {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            if self.stopped() {
                return None;
            }
            if self.source.state() != StreamState::Streaming {
                if let Err(err) = self.source.open() {
                    log::warn!(
                        "capture open failed: {err:#}; retrying in {:?}",
                        self.source.config().open_retry
                    );
                    if !self.sleep_unless_stopped(self.source.config().open_retry) {
                        return None;
                    }
                    continue;
                }
            }
            match self.source.next_frame() {
                Ok(frame) => return Some(frame),
                Err(err) => {
                    log::warn!("stream fault: {err:#}; reconnecting");
                    self.source.close();
                    if !self.sleep_unless_stopped(self.source.config().fault_pause) {
                        return None;
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic device (stub://)
// ----------------------------------------------------------------------------

/// Synthetic capture device backing `stub://` URLs.
///
/// Generates an RGB test pattern at the configured rate. The fault plan makes
/// opens and reads fail on a deterministic schedule.
#[derive(Debug)]
struct SyntheticDevice {
    width: u32,
    height: u32,
    target_fps: u32,
    plan: FaultPlan,
    opened: bool,
    opens_attempted: u32,
    reads: u64,
    scene_state: u8,
    last_read: Option<Instant>,
}

impl SyntheticDevice {
    fn new(config: &CaptureConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            target_fps: config.target_fps,
            plan: FaultPlan::default(),
            opened: false,
            opens_attempted: 0,
            reads: 0,
            scene_state: 0,
            last_read: None,
        }
    }

    fn open(&mut self) -> Result<()> {
        self.opens_attempted += 1;
        if self.opens_attempted <= self.plan.open_failures {
            bail!(
                "synthetic device unavailable (attempt {})",
                self.opens_attempted
            );
        }
        self.opened = true;
        Ok(())
    }

    fn release(&mut self) {
        self.opened = false;
    }

    fn read(&mut self) -> Vec<u8> {
        self.pace();
        self.reads += 1;
        if self.plan.read_faults.contains(&self.reads) {
            return Vec::new();
        }
        if self.reads % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.reads + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }

    fn pace(&mut self) {
        if self.target_fps == 0 {
            return;
        }
        let period = Duration::from_millis(1000 / self.target_fps.max(1) as u64);
        if let Some(last) = self.last_read {
            let elapsed = last.elapsed();
            if elapsed < period {
                std::thread::sleep(period - elapsed);
            }
        }
        self.last_read = Some(Instant::now());
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            url: "stub://test".to_string(),
            source_id: "edge0".to_string(),
            target_fps: 0,
            width: 32,
            height: 24,
            open_retry: Duration::from_millis(5),
            fault_pause: Duration::from_millis(2),
        }
    }

    #[test]
    fn synthetic_source_yields_frames_with_metadata() {
        let source = FrameSource::new(test_config()).expect("source");
        source.open().expect("open");
        assert_eq!(source.state(), StreamState::Streaming);

        let frame = source.next_frame().expect("frame");
        assert_eq!(frame.sequence_id, 1);
        assert_eq!(frame.source_id, "edge0");
        assert_eq!(frame.payload.len(), 32 * 24 * 3);
        assert_eq!(frame.dimensions(), Some((32, 24)));
        assert_eq!(
            frame.metadata.get(META_PIXEL_FORMAT).map(String::as_str),
            Some(PIXEL_FORMAT_RGB8)
        );
    }

    #[test]
    fn sequence_ids_strictly_increase() {
        let source = FrameSource::new(test_config()).expect("source");
        source.open().expect("open");
        let mut last = 0;
        for _ in 0..5 {
            let frame = source.next_frame().expect("frame");
            assert!(frame.sequence_id > last);
            last = frame.sequence_id;
        }
        assert_eq!(source.stats().frames_captured, 5);
    }

    #[test]
    fn next_frame_requires_streaming() {
        let source = FrameSource::new(test_config()).expect("source");
        let err = source.next_frame().unwrap_err();
        assert!(err.to_string().contains("Disconnected"));
    }

    #[test]
    fn open_retries_after_initial_failures() {
        let source = FrameSource::new(test_config())
            .expect("source")
            .with_fault_plan(FaultPlan {
                open_failures: 1,
                read_faults: Vec::new(),
            });
        assert!(source.open().is_err());
        assert_eq!(source.state(), StreamState::Disconnected);
        source.open().expect("second open succeeds");
        assert_eq!(source.state(), StreamState::Streaming);
    }

    #[test]
    fn close_is_idempotent_and_thread_safe() {
        let source = Arc::new(FrameSource::new(test_config()).expect("source"));
        source.open().expect("open");

        let closer = source.clone();
        let handle = std::thread::spawn(move || {
            closer.close();
            closer.close();
        });
        handle.join().expect("closer thread");

        assert_eq!(source.state(), StreamState::Disconnected);
        source.open().expect("reopen after close");
        assert_eq!(source.state(), StreamState::Streaming);
    }

    #[test]
    fn producer_survives_faults_and_preserves_sequence() {
        let source = Arc::new(
            FrameSource::new(test_config())
                .expect("source")
                .with_fault_plan(FaultPlan {
                    open_failures: 2,
                    read_faults: vec![2],
                }),
        );
        let stop = Arc::new(AtomicBool::new(false));
        let mut producer = FrameProducer::new(source.clone(), stop.clone());

        let ids: Vec<u64> = producer
            .by_ref()
            .take(3)
            .map(|frame| frame.sequence_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(source.stats().reconnects >= 1);

        stop.store(true, Ordering::SeqCst);
        assert!(producer.next().is_none());
    }

    #[test]
    fn producer_exits_backoff_when_stopped() {
        let mut config = test_config();
        config.open_retry = Duration::from_secs(30);
        let source = Arc::new(
            FrameSource::new(config)
                .expect("source")
                .with_fault_plan(FaultPlan {
                    open_failures: u32::MAX,
                    read_faults: Vec::new(),
                }),
        );
        let stop = Arc::new(AtomicBool::new(false));
        let mut producer = FrameProducer::new(source, stop.clone());

        let stopper = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            stopper.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        assert!(producer.next().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unknown_scheme_rejected() {
        let config = CaptureConfig {
            url: "rtsp://camera".to_string(),
            ..test_config()
        };
        let err = FrameSource::new(config).unwrap_err();
        assert!(err.to_string().contains("rtsp"));
    }
}
