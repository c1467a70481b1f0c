//! Frame capture sources.
//!
//! This module produces the pipeline's input stream:
//! - `FrameSource` wraps one capture device and owns its reconnect state.
//! - `FrameProducer` is the restartable, infinite frame iterator: it retries
//!   failed opens forever, treats empty reads as stream faults, and
//!   terminates only through its external stop flag.
//!
//! Capture failures never escape this module; they are logged and retried.

pub mod source;

pub use source::{CaptureConfig, CaptureStats, FaultPlan, FrameProducer, FrameSource, StreamState};
