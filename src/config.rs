use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::capture::CaptureConfig;
use crate::engine::EngineConfig;
use crate::telemetry::TelemetryConfig;

const DEFAULT_CAPTURE_URL: &str = "stub://edge_camera";
const DEFAULT_SOURCE_ID: &str = "edge0";
const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_TOPIC_PREFIX: &str = "telemetry";
const DEFAULT_ENGINE_KIND: &str = "pixel-delta";
const DEFAULT_THRESHOLD: f32 = 0.25;
const DEFAULT_PREVIEW_MAX_WIDTH: u32 = 640;
const DEFAULT_JPEG_QUALITY: u8 = 70;

#[derive(Debug, Deserialize, Default)]
struct VigildConfigFile {
    capture: Option<CaptureConfigFile>,
    telemetry: Option<TelemetryConfigFile>,
    engine: Option<EngineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    url: Option<String>,
    source_id: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    broker_addr: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    preview_max_width: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    kind: Option<String>,
    model_path: Option<PathBuf>,
    threshold: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct VigildConfig {
    pub capture: CaptureSettings,
    pub telemetry: TelemetrySettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub url: String,
    pub source_id: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub broker_addr: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub preview_max_width: u32,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub kind: String,
    pub model_path: Option<PathBuf>,
    pub threshold: f32,
}

impl VigildConfig {
    /// Load from the optional JSON file named by `VIGIL_CONFIG`, then apply
    /// `VIGIL_*` environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VIGIL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VigildConfigFile) -> Self {
        let capture = CaptureSettings {
            url: file
                .capture
                .as_ref()
                .and_then(|capture| capture.url.clone())
                .unwrap_or_else(|| DEFAULT_CAPTURE_URL.to_string()),
            source_id: file
                .capture
                .as_ref()
                .and_then(|capture| capture.source_id.clone())
                .unwrap_or_else(|| DEFAULT_SOURCE_ID.to_string()),
            target_fps: file
                .capture
                .as_ref()
                .and_then(|capture| capture.target_fps)
                .unwrap_or(DEFAULT_TARGET_FPS),
            width: file
                .capture
                .as_ref()
                .and_then(|capture| capture.width)
                .unwrap_or(DEFAULT_WIDTH),
            height: file
                .capture
                .as_ref()
                .and_then(|capture| capture.height)
                .unwrap_or(DEFAULT_HEIGHT),
        };
        let telemetry = TelemetrySettings {
            broker_addr: file
                .telemetry
                .as_ref()
                .and_then(|telemetry| telemetry.broker_addr.clone())
                .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
            topic_prefix: file
                .telemetry
                .as_ref()
                .and_then(|telemetry| telemetry.topic_prefix.clone())
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            client_id: file
                .telemetry
                .as_ref()
                .and_then(|telemetry| telemetry.client_id.clone())
                .unwrap_or_else(default_client_id),
            username: file
                .telemetry
                .as_ref()
                .and_then(|telemetry| telemetry.username.clone()),
            password: file
                .telemetry
                .as_ref()
                .and_then(|telemetry| telemetry.password.clone()),
            preview_max_width: file
                .telemetry
                .as_ref()
                .and_then(|telemetry| telemetry.preview_max_width)
                .unwrap_or(DEFAULT_PREVIEW_MAX_WIDTH),
            jpeg_quality: file
                .telemetry
                .as_ref()
                .and_then(|telemetry| telemetry.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY),
        };
        let engine = EngineSettings {
            kind: file
                .engine
                .as_ref()
                .and_then(|engine| engine.kind.clone())
                .unwrap_or_else(|| DEFAULT_ENGINE_KIND.to_string()),
            model_path: file.engine.as_ref().and_then(|engine| engine.model_path.clone()),
            threshold: file
                .engine
                .as_ref()
                .and_then(|engine| engine.threshold)
                .unwrap_or(DEFAULT_THRESHOLD),
        };
        Self {
            capture,
            telemetry,
            engine,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("VIGIL_CAPTURE_URL") {
            if !url.trim().is_empty() {
                self.capture.url = url;
            }
        }
        if let Ok(source_id) = std::env::var("VIGIL_SOURCE_ID") {
            if !source_id.trim().is_empty() {
                self.capture.source_id = source_id;
            }
        }
        if let Ok(fps) = std::env::var("VIGIL_TARGET_FPS") {
            let fps: u32 = fps
                .parse()
                .map_err(|_| anyhow!("VIGIL_TARGET_FPS must be an integer frame rate"))?;
            self.capture.target_fps = fps;
        }
        if let Ok(addr) = std::env::var("VIGIL_BROKER_ADDR") {
            if !addr.trim().is_empty() {
                self.telemetry.broker_addr = addr;
            }
        }
        if let Ok(prefix) = std::env::var("VIGIL_TOPIC_PREFIX") {
            if !prefix.trim().is_empty() {
                self.telemetry.topic_prefix = prefix;
            }
        }
        if let Ok(client_id) = std::env::var("VIGIL_CLIENT_ID") {
            if !client_id.trim().is_empty() {
                self.telemetry.client_id = client_id;
            }
        }
        if let Ok(username) = std::env::var("VIGIL_MQTT_USERNAME") {
            if !username.trim().is_empty() {
                self.telemetry.username = Some(username);
            }
        }
        if let Ok(password) = std::env::var("VIGIL_MQTT_PASSWORD") {
            if !password.is_empty() {
                self.telemetry.password = Some(password);
            }
        }
        if let Ok(kind) = std::env::var("VIGIL_ENGINE") {
            if !kind.trim().is_empty() {
                self.engine.kind = kind;
            }
        }
        if let Ok(path) = std::env::var("VIGIL_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.engine.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(threshold) = std::env::var("VIGIL_THRESHOLD") {
            let threshold: f32 = threshold
                .parse()
                .map_err(|_| anyhow!("VIGIL_THRESHOLD must be a number in (0, 1]"))?;
            self.engine.threshold = threshold;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.capture.source_id = self.capture.source_id.to_lowercase();
        crate::validate_source_id(&self.capture.source_id)?;

        if self.capture.target_fps == 0 {
            return Err(anyhow!("target_fps must be greater than zero"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("frame dimensions must be greater than zero"));
        }

        crate::telemetry::parse_broker_endpoint(&self.telemetry.broker_addr)?;
        let prefix = self.telemetry.topic_prefix.trim();
        if prefix.is_empty() {
            return Err(anyhow!("topic prefix must not be empty"));
        }
        if prefix.contains('#') || prefix.contains('+') {
            return Err(anyhow!("topic prefix must not contain wildcards"));
        }
        if prefix.ends_with('/') {
            return Err(anyhow!("topic prefix must not end with '/'"));
        }
        if self.telemetry.client_id.trim().is_empty() {
            return Err(anyhow!("client id must not be empty"));
        }
        if !(1..=100).contains(&self.telemetry.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }

        if !(self.engine.threshold > 0.0 && self.engine.threshold <= 1.0) {
            return Err(anyhow!("threshold must be within (0, 1]"));
        }
        match self.engine.kind.as_str() {
            "pixel-delta" => {}
            "tract" => {
                if self.engine.model_path.is_none() {
                    return Err(anyhow!("engine 'tract' requires a model_path"));
                }
            }
            other => return Err(anyhow!("unknown analysis engine '{}'", other)),
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            url: self.capture.url.clone(),
            source_id: self.capture.source_id.clone(),
            target_fps: self.capture.target_fps,
            width: self.capture.width,
            height: self.capture.height,
            ..CaptureConfig::default()
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            broker_addr: self.telemetry.broker_addr.clone(),
            client_id: self.telemetry.client_id.clone(),
            topic_prefix: self.telemetry.topic_prefix.clone(),
            username: self.telemetry.username.clone(),
            password: self.telemetry.password.clone(),
            preview_max_width: self.telemetry.preview_max_width,
            jpeg_quality: self.telemetry.jpeg_quality,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            kind: self.engine.kind.clone(),
            model_path: self.engine.model_path.clone(),
            threshold: self.engine.threshold,
            width: self.capture.width,
            height: self.capture.height,
        }
    }
}

fn read_config_file(path: &Path) -> Result<VigildConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn default_client_id() -> String {
    format!("vigild-{:04x}", rand::random::<u16>())
}
