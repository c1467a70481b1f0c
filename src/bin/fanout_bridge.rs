//! fanout_bridge - telemetry rebroadcast daemon
//!
//! This daemon:
//! 1. Subscribes to the pipeline's telemetry topics on the MQTT broker
//! 2. Accepts live subscriber connections over plain TCP
//! 3. Rebroadcasts every preview and alert as one JSON envelope per line
//! 4. Drops a dead subscriber without disturbing the rest

use anyhow::Result;
use clap::Parser;
use std::sync::mpsc;

use vigil_edge::{BridgeConfig, FanoutBridge};

const BRIDGE_NAME: &str = "fanout_bridge";

#[derive(Parser, Debug)]
#[command(
    name = BRIDGE_NAME,
    about = "Rebroadcast pipeline telemetry to live subscribers"
)]
struct Args {
    /// MQTT broker address (host:port).
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// Telemetry topic prefix to subscribe under.
    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "telemetry")]
    topic_prefix: String,

    /// Address the subscriber listener binds to.
    #[arg(long, env = "BRIDGE_LISTEN_ADDR", default_value = "127.0.0.1:8750")]
    listen_addr: String,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = BRIDGE_NAME)]
    mqtt_client_id: String,

    /// MQTT username (optional).
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password (optional).
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = BridgeConfig {
        broker_addr: args.mqtt_broker_addr,
        client_id: args.mqtt_client_id,
        topic_prefix: args.topic_prefix,
        listen_addr: args.listen_addr,
        username: args.mqtt_username,
        password: args.mqtt_password,
    };
    let handle = FanoutBridge::new(config).spawn()?;
    log::info!("subscribers can connect on {}", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("fanout_bridge waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping bridge...");
    handle.stop()?;

    Ok(())
}
