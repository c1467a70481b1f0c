//! vigild - edge monitoring pipeline daemon
//!
//! This daemon:
//! 1. Pulls frames from the configured capture source
//! 2. Runs the analysis engine on every frame
//! 3. Publishes previews and alerts to the MQTT broker
//! 4. Rides out capture and broker faults without operator help

use std::sync::Arc;

use anyhow::Result;

use vigil_edge::{
    config::VigildConfig, engine::build_engine, FrameSource, MqttTelemetry, Pipeline,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = VigildConfig::load()?;
    log::info!("vigild {} starting", env!("CARGO_PKG_VERSION"));
    log::info!(
        "capture: {} (source_id={}, {}x{} @ {} fps)",
        cfg.capture.url,
        cfg.capture.source_id,
        cfg.capture.width,
        cfg.capture.height,
        cfg.capture.target_fps
    );
    log::info!(
        "telemetry: broker {}, topic prefix '{}'",
        cfg.telemetry.broker_addr,
        cfg.telemetry.topic_prefix
    );
    log::info!("engine: {}", cfg.engine.kind);

    let source = Arc::new(FrameSource::new(cfg.capture_config())?);
    let engine = build_engine(&cfg.engine_config())?;
    let telemetry = Box::new(MqttTelemetry::new(cfg.telemetry_config())?);

    let pipeline = Pipeline::new(source, engine, telemetry);
    pipeline.install_signal_handler();
    pipeline.start(true)?;

    log::info!("vigild exiting");
    Ok(())
}
