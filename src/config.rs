use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EngineError, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Recording storage configuration.
    pub storage: StorageConfig,
    /// Object detection configuration.
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Event recording configuration.
    #[serde(default)]
    pub recording: RecordingConfig,
    /// List of camera streams to watch.
    pub streams: Vec<StreamConfig>,
    /// HTTP API configuration (optional).
    #[serde(default)]
    pub api: ApiConfig,
}

/// HTTP API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Whether to enable the HTTP API.
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    /// Port to listen on.
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: default_api_enabled(), port: default_api_port() }
    }
}

fn default_api_enabled() -> bool { true }
fn default_api_port() -> u16 { 8080 }

/// Where clips land and how much disk they may use.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory where finalized clips, thumbnails and the catalogue live.
    pub recordings_dir: PathBuf,
    /// Maximum storage in gigabytes before the janitor starts evicting.
    #[serde(default = "default_max_storage_gb")]
    pub max_storage_gb: f64,
    /// Janitor tick period in seconds.
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
}

impl StorageConfig {
    pub fn max_storage_bytes(&self) -> u64 {
        (self.max_storage_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

/// Detector model and filtering parameters, shared by all streams.
#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    /// Path to the ONNX model file.
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    /// Model-level confidence threshold; detections below it are dropped
    /// before filtering.
    #[serde(default = "default_detect_confidence")]
    pub confidence: f32,
    /// Frame width every stream is resized to before inference.
    #[serde(default = "default_width")]
    pub width: u32,
    /// Frame height every stream is resized to before inference.
    #[serde(default = "default_height")]
    pub height: u32,
    /// Only keep detections of these classes (empty = keep all).
    #[serde(default)]
    pub filter_classes: Vec<String>,
    /// Drop detections whose bbox area is below this (pixels).
    #[serde(default)]
    pub min_area: Option<f32>,
    /// Drop detections whose bbox area is above this (pixels).
    #[serde(default)]
    pub max_area: Option<f32>,
    /// TrueType font used for box labels. Labels are skipped if unreadable.
    #[serde(default = "default_label_font")]
    pub label_font: PathBuf,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            confidence: default_detect_confidence(),
            width: default_width(),
            height: default_height(),
            filter_classes: Vec::new(),
            min_area: None,
            max_area: None,
            label_font: default_label_font(),
        }
    }
}

/// Event recorder parameters, shared by all streams.
#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    /// Seconds of footage kept before the triggering detection.
    #[serde(default = "default_pre_buffer")]
    pub pre_buffer_seconds: u32,
    /// Seconds of detection silence before a clip is finalized.
    #[serde(default = "default_post_buffer")]
    pub post_buffer_seconds: u32,
    /// Minimum detection confidence that can trigger or extend a clip.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Frame rate written into clip headers and used to size the pre-roll ring.
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Video codec: "mp4v" (default) or "h264"/"x264".
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Only these classes trigger a recording (empty = all qualify).
    #[serde(default)]
    pub record_objects: Vec<String>,
    /// Minimum seconds between the starts of two recordings on one stream.
    #[serde(default = "default_min_gap")]
    pub min_gap_secs: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            pre_buffer_seconds: default_pre_buffer(),
            post_buffer_seconds: default_post_buffer(),
            min_confidence: default_min_confidence(),
            fps: default_fps(),
            codec: default_codec(),
            record_objects: Vec::new(),
            min_gap_secs: default_min_gap(),
        }
    }
}

/// Per-stream configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamConfig {
    /// Human-readable label, also used in clip file names.
    pub name: String,
    /// RTSP or RTSPS URL, possibly with embedded credentials.
    pub url: String,
    /// Seconds to wait before re-opening a failed source.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
}

fn default_max_storage_gb() -> f64 { 10.0 }
fn default_janitor_interval() -> u64 { 3600 }
fn default_model_path() -> PathBuf { PathBuf::from("yolov8n.onnx") }
fn default_detect_confidence() -> f32 { 0.4 }
fn default_width() -> u32 { 960 }
fn default_height() -> u32 { 540 }
fn default_label_font() -> PathBuf {
    PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf")
}
fn default_pre_buffer() -> u32 { 5 }
fn default_post_buffer() -> u32 { 5 }
fn default_min_confidence() -> f32 { 0.5 }
fn default_fps() -> u32 { 10 }
fn default_codec() -> String { "mp4v".into() }
fn default_min_gap() -> u32 { 5 }
fn default_reconnect_interval() -> u64 { 5 }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(EngineError::Config("No streams defined".into()));
        }
        for s in &self.streams {
            if !s.url.starts_with("rtsp://") && !s.url.starts_with("rtsps://") {
                return Err(EngineError::Config(format!(
                    "Stream '{}': URL must be rtsp:// or rtsps://", s.name
                )));
            }
            if s.name.trim().is_empty() {
                return Err(EngineError::Config("Stream name must not be empty".into()));
            }
        }
        if self.recording.fps == 0 {
            return Err(EngineError::Config("recording.fps must be > 0".into()));
        }
        if self.recording.post_buffer_seconds == 0 {
            return Err(EngineError::Config("recording.post_buffer_seconds must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.recording.min_confidence) {
            return Err(EngineError::Config("recording.min_confidence must be in [0, 1]".into()));
        }
        if self.storage.max_storage_gb <= 0.0 {
            return Err(EngineError::Config("storage.max_storage_gb must be > 0".into()));
        }
        crate::clip::encoder_element(&self.recording.codec).ok_or_else(|| {
            EngineError::Config(format!("Unknown codec '{}'", self.recording.codec))
        })?;
        Ok(())
    }
}
