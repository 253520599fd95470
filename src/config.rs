// src/config.rs
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::permission::PermissionMode;

/// Looked up in the working directory when no path is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "seg_cam.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub index: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Clockwise rotation the sensor output needs to become upright.
    #[serde(default)]
    pub rotation_degrees: i32,
    /// Upper bound of the digital zoom ratio (lower bound is always 1.0).
    #[serde(default = "default_max_zoom")]
    pub max_zoom: f32,
    #[serde(default = "default_zoom_slider_max")]
    pub zoom_slider_max: u32,
    #[serde(default = "default_permission")]
    pub permission: PermissionMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_path")]
    pub path: PathBuf,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_iou")]
    pub iou: f32,
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: f32,
    /// Empty means the COCO-80 label set.
    #[serde(default)]
    pub class_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Overrides the platform downloads directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_catalog_file")]
    pub catalog_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            rotation_degrees: 0,
            max_zoom: default_max_zoom(),
            zoom_slider_max: default_zoom_slider_max(),
            permission: default_permission(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            input_size: default_input_size(),
            confidence: default_confidence(),
            iou: default_iou(),
            mask_threshold: default_mask_threshold(),
            class_names: Vec::new(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: None,
            catalog_file: default_catalog_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Explicit path wins; otherwise `seg_cam.toml` if present, else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.max_zoom.is_nan() || self.camera.max_zoom < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "camera.max_zoom must be >= 1.0, got {}",
                self.camera.max_zoom
            )));
        }
        if self.camera.zoom_slider_max == 0 {
            return Err(ConfigError::Invalid(
                "camera.zoom_slider_max must be positive".into(),
            ));
        }
        if self.model.input_size == 0 || self.model.input_size % 32 != 0 {
            return Err(ConfigError::Invalid(format!(
                "model.input_size must be a positive multiple of 32, got {}",
                self.model.input_size
            )));
        }
        for (name, value) in [
            ("model.confidence", self.model.confidence),
            ("model.iou", self.model.iou),
            ("model.mask_threshold", self.model.mask_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> u32 {
    30
}
fn default_max_zoom() -> f32 {
    4.0
}
fn default_zoom_slider_max() -> u32 {
    100
}
fn default_permission() -> PermissionMode {
    PermissionMode::Prompt
}
fn default_model_path() -> PathBuf {
    PathBuf::from("models/yolo11n-seg.onnx")
}
fn default_input_size() -> u32 {
    640
}
fn default_confidence() -> f32 {
    0.25
}
fn default_iou() -> f32 {
    0.45
}
fn default_mask_threshold() -> f32 {
    0.5
}
fn default_catalog_file() -> String {
    "media_index.jsonl".into()
}
fn default_log_level() -> String {
    "info".into()
}
