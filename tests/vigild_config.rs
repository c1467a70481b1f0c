use std::sync::Mutex;

use tempfile::NamedTempFile;

use vigil_edge::config::VigildConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VIGIL_CONFIG",
        "VIGIL_CAPTURE_URL",
        "VIGIL_SOURCE_ID",
        "VIGIL_TARGET_FPS",
        "VIGIL_BROKER_ADDR",
        "VIGIL_TOPIC_PREFIX",
        "VIGIL_CLIENT_ID",
        "VIGIL_MQTT_USERNAME",
        "VIGIL_MQTT_PASSWORD",
        "VIGIL_ENGINE",
        "VIGIL_MODEL_PATH",
        "VIGIL_THRESHOLD",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_cover_every_field() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = VigildConfig::load().expect("load defaults");

    assert_eq!(cfg.capture.url, "stub://edge_camera");
    assert_eq!(cfg.capture.source_id, "edge0");
    assert_eq!(cfg.capture.target_fps, 10);
    assert_eq!(cfg.capture.width, 640);
    assert_eq!(cfg.capture.height, 480);
    assert_eq!(cfg.telemetry.broker_addr, "127.0.0.1:1883");
    assert_eq!(cfg.telemetry.topic_prefix, "telemetry");
    assert!(cfg.telemetry.client_id.starts_with("vigild-"));
    assert!(cfg.telemetry.username.is_none());
    assert_eq!(cfg.telemetry.preview_max_width, 640);
    assert_eq!(cfg.telemetry.jpeg_quality, 70);
    assert_eq!(cfg.engine.kind, "pixel-delta");
    assert!(cfg.engine.model_path.is_none());
    assert!((cfg.engine.threshold - 0.25).abs() < f32::EPSILON);

    clear_env();
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "capture": {
            "url": "stub://bench_rig",
            "source_id": "bench1",
            "target_fps": 24,
            "width": 800,
            "height": 600
        },
        "telemetry": {
            "broker_addr": "broker.lan:1884",
            "topic_prefix": "plant/line4",
            "client_id": "vigild-bench",
            "username": "ops",
            "preview_max_width": 320,
            "jpeg_quality": 55
        },
        "engine": {
            "kind": "pixel-delta",
            "threshold": 0.4
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("VIGIL_CONFIG", file.path());
    std::env::set_var("VIGIL_SOURCE_ID", "bench2");
    std::env::set_var("VIGIL_THRESHOLD", "0.6");

    let cfg = VigildConfig::load().expect("load config");

    assert_eq!(cfg.capture.url, "stub://bench_rig");
    assert_eq!(cfg.capture.source_id, "bench2");
    assert_eq!(cfg.capture.target_fps, 24);
    assert_eq!(cfg.capture.width, 800);
    assert_eq!(cfg.capture.height, 600);
    assert_eq!(cfg.telemetry.broker_addr, "broker.lan:1884");
    assert_eq!(cfg.telemetry.topic_prefix, "plant/line4");
    assert_eq!(cfg.telemetry.client_id, "vigild-bench");
    assert_eq!(cfg.telemetry.username.as_deref(), Some("ops"));
    assert_eq!(cfg.telemetry.preview_max_width, 320);
    assert_eq!(cfg.telemetry.jpeg_quality, 55);
    assert!((cfg.engine.threshold - 0.6).abs() < f32::EPSILON);

    clear_env();
}

#[test]
fn source_id_is_normalized_to_lowercase() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_SOURCE_ID", "Dock-3");
    let cfg = VigildConfig::load().expect("load config");
    assert_eq!(cfg.capture.source_id, "dock-3");

    clear_env();
}

#[test]
fn rejects_invalid_source_id() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_SOURCE_ID", "-leading-dash");
    assert!(VigildConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_wildcard_or_trailing_slash_topic_prefix() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_TOPIC_PREFIX", "telemetry/#");
    assert!(VigildConfig::load().is_err());

    std::env::set_var("VIGIL_TOPIC_PREFIX", "telemetry/");
    assert!(VigildConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_unknown_engine_kind() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_ENGINE", "quantum");
    let err = VigildConfig::load().unwrap_err();
    assert!(format!("{err:#}").contains("unknown analysis engine"));

    clear_env();
}

#[test]
fn tract_engine_requires_a_model_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_ENGINE", "tract");
    let err = VigildConfig::load().unwrap_err();
    assert!(format!("{err:#}").contains("model_path"));

    std::env::set_var("VIGIL_MODEL_PATH", "/opt/models/defect.onnx");
    let cfg = VigildConfig::load().expect("load config");
    assert_eq!(cfg.engine.kind, "tract");
    assert!(cfg.engine.model_path.is_some());

    clear_env();
}

#[test]
fn rejects_malformed_numeric_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_TARGET_FPS", "fast");
    assert!(VigildConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_out_of_range_jpeg_quality() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "telemetry": { "jpeg_quality": 0 } }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("VIGIL_CONFIG", file.path());

    assert!(VigildConfig::load().is_err());

    clear_env();
}
