//! # Configuration Management Module
//!
//! Persistent application settings stored in platform-appropriate locations.
//! Handles loading, saving, validating and providing defaults for the
//! acquisition task and its display.
//!
//! ## Settings
//! - Device and default task name
//! - Sample rate, frame duration and buffer rate: defaults plus allowed ranges
//! - Display cadence and wave/spectrum downsampling
//! - Recording directory and default writer type
//! - Anomaly threshold and default sensor calibration records
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/daq-stream/config.toml
//! - Linux: ~/.config/daq-stream/config.toml
//! - Windows: %APPDATA%\daq-stream\config.toml

use crate::acquisition::{AccelerometerConfig, MicrophoneConfig};
use crate::anomaly::DEFAULT_THRESHOLD;
use crate::error::ConfigError;
use crate::recorder::WriterType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device_name: String,
    pub default_task_name: String,

    pub default_sample_rate: f64,
    pub min_sample_rate: f64,
    pub max_sample_rate: f64,

    pub default_frame_duration_ms: u32,
    pub min_frame_duration_ms: u32,
    pub max_frame_duration_ms: u32,

    pub default_buffer_rate: usize,
    pub min_buffer_rate: usize,
    pub max_buffer_rate: usize,

    /// Display refresh cadence; never faster than one frame
    pub max_update_interval_ms: u32,

    pub default_wave_downsample: usize,
    pub max_wave_downsample: usize,
    pub default_spectrum_downsample: usize,
    pub max_spectrum_downsample: usize,

    pub default_write_file_dir: PathBuf,
    pub default_writer_type: WriterType,

    pub anomaly_threshold: f64,

    pub accelerometer: AccelerometerConfig,
    pub microphone: MicrophoneConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_name: "cDAQ1Mod1".to_string(),
            default_task_name: "daq_task".to_string(),
            default_sample_rate: 12800.0,
            min_sample_rate: 1000.0,
            max_sample_rate: 51200.0,
            default_frame_duration_ms: 100,
            min_frame_duration_ms: 10,
            max_frame_duration_ms: 1000,
            default_buffer_rate: 10,
            min_buffer_rate: 1,
            max_buffer_rate: 50,
            max_update_interval_ms: 1000,
            default_wave_downsample: 4,
            max_wave_downsample: 64,
            default_spectrum_downsample: 1,
            max_spectrum_downsample: 16,
            default_write_file_dir: PathBuf::from("."),
            default_writer_type: WriterType::Stream,
            anomaly_threshold: DEFAULT_THRESHOLD,
            accelerometer: AccelerometerConfig::default(),
            microphone: MicrophoneConfig::default(),
        }
    }
}

impl AppConfig {
    /// Get the path to the config file
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("daq-stream")
            .join("config.toml")
    }

    /// Load config from the default location, creating it if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::config_path())
    }

    /// Load config from `path`, writing defaults there if the file is missing
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Self = toml::from_str(&contents)
                    .map_err(ConfigError::ParseFailed)?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                log::info!("Wrote default settings to {}", path.display());
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string)
            .map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    /// Check that every default lies inside its configured range
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "default_sample_rate",
            self.default_sample_rate,
            self.min_sample_rate,
            self.max_sample_rate,
        )?;
        check_range(
            "default_frame_duration_ms",
            self.default_frame_duration_ms as f64,
            self.min_frame_duration_ms.max(1) as f64,
            self.max_frame_duration_ms as f64,
        )?;
        check_range(
            "default_buffer_rate",
            self.default_buffer_rate as f64,
            self.min_buffer_rate.max(1) as f64,
            self.max_buffer_rate as f64,
        )?;
        check_range(
            "default_wave_downsample",
            self.default_wave_downsample as f64,
            1.0,
            self.max_wave_downsample as f64,
        )?;
        check_range(
            "default_spectrum_downsample",
            self.default_spectrum_downsample as f64,
            1.0,
            self.max_spectrum_downsample as f64,
        )?;
        check_range("anomaly_threshold", self.anomaly_threshold, 0.0, f64::MAX)?;
        Ok(())
    }

    /// Clamp a requested refresh interval to `[frame_duration, max_update_interval]`
    pub fn clamp_update_interval(&self, requested_ms: u32, frame_duration_ms: u32) -> u32 {
        let max = self.max_update_interval_ms.max(frame_duration_ms);
        requested_ms.clamp(frame_duration_ms, max)
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange { field, value, min, max });
    }
    Ok(())
}
