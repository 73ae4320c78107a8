//! Runtime configuration, loaded from YAML.
//!
//! Every section has defaults, so an empty file (or no file) yields a working
//! configuration for a development machine with a webcam at index 0.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::violation_detection::plate_locator::{
    SelectionPolicy, MAX_PLATE_ASPECT, MIN_PLATE_ASPECT,
};
use crate::violation_detection::SPEED_THRESHOLD_MPS;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Speeds strictly above this value (m/s) are violations.
    pub threshold_mps: f64,
    pub sensor: SensorConfig,
    pub camera: CameraConfig,
    pub locator: LocatorConfig,
    pub ocr: OcrConfig,
    pub storage: StorageConfig,
    pub notification: NotificationConfig,
    pub queue: QueueConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold_mps: SPEED_THRESHOLD_MPS,
            sensor: SensorConfig::default(),
            camera: CameraConfig::default(),
            locator: LocatorConfig::default(),
            ocr: OcrConfig::default(),
            storage: StorageConfig::default(),
            notification: NotificationConfig::default(),
            queue: QueueConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorBackend {
    Gpio,
    Scripted,
    Constant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub backend: SensorBackend,
    pub gpio_pin: u32,
    /// Speed reported by a digital sensor while its line is high.
    pub nominal_speed_mps: f64,
    pub script_path: Option<PathBuf>,
    pub constant_speed_mps: f64,
    pub poll_interval_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            backend: SensorBackend::Gpio,
            gpio_pin: 17,
            nominal_speed_mps: 10.0,
            script_path: None,
            constant_speed_mps: 0.0,
            poll_interval_ms: 100,
            cooldown_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraBackend {
    Device,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub backend: CameraBackend,
    /// Device index, `/dev/videoN`, stream URI, or image path for `file`.
    pub uri: String,
    pub width: i32,
    pub height: i32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackend::Device,
            uri: "0".to_string(),
            width: 640,
            height: 480,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub blur_kernel: i32,
    pub canny_low: f64,
    pub canny_high: f64,
    pub min_aspect: f64,
    pub max_aspect: f64,
    pub selection: SelectionPolicy,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            blur_kernel: 5,
            canny_low: 50.0,
            canny_high: 150.0,
            min_aspect: MIN_PLATE_ASPECT,
            max_aspect: MAX_PLATE_ASPECT,
            selection: SelectionPolicy::First,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub data_path: String,
    pub language: String,
    pub whitelist: String,
    pub page_seg_mode: u32,
    /// Tesseract mean confidence (0-100) below which a reading is discarded.
    pub min_confidence: i32,
    pub deblur: bool,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            data_path: "models".to_string(),
            language: "eng".to_string(),
            whitelist: "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".to_string(),
            page_seg_mode: 7,
            min_confidence: 0,
            deblur: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub evidence_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("speed_monitor.db"),
            evidence_dir: PathBuf::from("captured_images"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub smtp_server: String,
    pub smtp_port: u16,
    /// Environment variable holding the sender address / login.
    pub user_env: String,
    pub password_env: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            user_env: "EMAIL_USER".to_string(),
            password_env: "EMAIL_PASSWORD".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 4 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub pyroscope_url: Option<String>,
    pub metrics_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.threshold_mps, 7.0);
        assert_eq!(config.sensor.backend, SensorBackend::Gpio);
        assert_eq!(config.sensor.gpio_pin, 17);
        assert_eq!(config.locator.selection, SelectionPolicy::First);
        assert_eq!(config.notification.smtp_port, 587);
        assert_eq!(config.queue.capacity, 4);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let yaml = r#"
threshold_mps: 9.5
sensor:
  backend: scripted
  script_path: speeds.txt
locator:
  selection: largest_area
camera:
  backend: file
  uri: data/car.jpg
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.threshold_mps, 9.5);
        assert_eq!(config.sensor.backend, SensorBackend::Scripted);
        assert_eq!(config.sensor.script_path, Some(PathBuf::from("speeds.txt")));
        assert_eq!(config.sensor.poll_interval_ms, 100);
        assert_eq!(config.locator.selection, SelectionPolicy::LargestArea);
        assert_eq!(config.locator.canny_high, 150.0);
        assert_eq!(config.camera.backend, CameraBackend::File);
        assert_eq!(config.camera.width, 640);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let result: Result<Config, _> = serde_yaml::from_str("sensor:\n  backend: lidar\n");
        assert!(result.is_err());
    }
}
