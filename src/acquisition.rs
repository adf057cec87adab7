//! # Channel & Task Configuration Module
//!
//! Plain configuration values for an acquisition task and the configurator
//! that validates changes to them. Nothing here talks to hardware: the engine
//! reads the derived sizes and pushes them to the driver.
//!
//! ## Derived Sizes
//! - `frame_size = round(sample_rate * frame_duration / 1000)`
//! - `driver_buffer_size = frame_size * DRIVER_BUFFER_FRAMES`
//! - `wave_buffer_len = buffer_rate * frame_size`
//! - `spectrum_bins = frame_size / 2 + 1`
//!
//! ## Channel Rules
//! At most `MAX_CHANNELS` channels, each physical input used once, indices
//! limited to `VALID_CHANNELS`. A rejected change leaves the config untouched.

use crate::config::AppConfig;
use crate::error::{AcquisitionError, ChannelError};
use serde::{Deserialize, Serialize};

/// Analog inputs available on the module
pub const VALID_CHANNELS: [u8; 4] = [0, 1, 2, 3];

pub const MAX_CHANNELS: usize = 4;

/// Driver input buffer headroom, in frames
pub const DRIVER_BUFFER_FRAMES: usize = 10;

/// Calibration record for an IEPE accelerometer input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccelerometerConfig {
    pub name: String,
    pub terminal_config: String,
    pub min_val: f64,
    pub max_val: f64,
    pub units: String,
    pub sensitivity: f64,
    pub sensitivity_units: String,
    pub current_excit_source: String,
    pub current_excit_val: f64,
    pub custom_scale_name: String,
}

impl Default for AccelerometerConfig {
    fn default() -> Self {
        Self {
            name: "accelerometer".to_string(),
            terminal_config: "default".to_string(),
            min_val: -5.0,
            max_val: 5.0,
            units: "g".to_string(),
            sensitivity: 100.0,
            sensitivity_units: "millivolts_per_g".to_string(),
            current_excit_source: "internal".to_string(),
            current_excit_val: 0.004,
            custom_scale_name: String::new(),
        }
    }
}

/// Calibration record for a measurement microphone input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicrophoneConfig {
    pub name: String,
    pub terminal_config: String,
    pub units: String,
    pub mic_sensitivity: f64,
    pub max_snd_press_level: f64,
    pub current_excit_source: String,
    pub current_excit_val: f64,
    pub custom_scale_name: String,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            name: "microphone".to_string(),
            terminal_config: "default".to_string(),
            units: "Pa".to_string(),
            mic_sensitivity: 10.0,
            max_snd_press_level: 100.0,
            current_excit_source: "internal".to_string(),
            current_excit_val: 0.004,
            custom_scale_name: String::new(),
        }
    }
}

/// Sensor attached to a physical channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorConfig {
    Accelerometer(AccelerometerConfig),
    Microphone(MicrophoneConfig),
}

impl SensorConfig {
    pub fn name(&self) -> &str {
        match self {
            SensorConfig::Accelerometer(cfg) => &cfg.name,
            SensorConfig::Microphone(cfg) => &cfg.name,
        }
    }

    pub fn units(&self) -> &str {
        match self {
            SensorConfig::Accelerometer(cfg) => &cfg.units,
            SensorConfig::Microphone(cfg) => &cfg.units,
        }
    }

    /// Parse the short sensor names used on the command line (`accel`, `mic`)
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "accel" | "accelerometer" => Some(SensorConfig::Accelerometer(AccelerometerConfig::default())),
            "mic" | "microphone" => Some(SensorConfig::Microphone(MicrophoneConfig::default())),
            _ => None,
        }
    }
}

/// A physical input and the sensor wired to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub physical_index: u8,
    pub sensor: SensorConfig,
}

impl ChannelConfig {
    /// Driver-side physical channel, e.g. `cDAQ1Mod1/ai0`
    pub fn physical_channel(&self, device: &str) -> String {
        format!("{}/ai{}", device, self.physical_index)
    }

    /// Name assigned to the channel inside the task
    pub fn name(&self, device: &str) -> String {
        format!("{}-ch{}-{}", device, self.physical_index, self.sensor.name())
    }
}

/// Everything needed to arm a task and size its buffers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    pub device: String,
    pub task_name: String,
    pub channels: Vec<ChannelConfig>,
    /// Hz
    pub sample_rate: f64,
    /// Milliseconds
    pub frame_duration_ms: u32,
    /// Frames retained by the rolling buffers
    pub buffer_rate: usize,
}

impl AcquisitionConfig {
    pub fn from_settings(settings: &AppConfig) -> Self {
        Self {
            device: settings.device_name.clone(),
            task_name: settings.default_task_name.clone(),
            channels: Vec::new(),
            sample_rate: settings.default_sample_rate,
            frame_duration_ms: settings.default_frame_duration_ms,
            buffer_rate: settings.default_buffer_rate,
        }
    }

    pub fn frame_size(&self) -> usize {
        compute_frame_size(self.sample_rate, self.frame_duration_ms)
    }

    pub fn driver_buffer_size(&self) -> usize {
        self.frame_size() * DRIVER_BUFFER_FRAMES
    }

    pub fn wave_buffer_len(&self) -> usize {
        self.buffer_rate * self.frame_size()
    }

    pub fn buffer_duration_ms(&self) -> u64 {
        self.frame_duration_ms as u64 * self.buffer_rate as u64
    }

    pub fn spectrum_bins(&self) -> usize {
        self.frame_size() / 2 + 1
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name(&self.device)).collect()
    }
}

pub fn compute_frame_size(sample_rate: f64, frame_duration_ms: u32) -> usize {
    (sample_rate * frame_duration_ms as f64 / 1000.0).round() as usize
}

/// Validates and records channel assignments and task timing
#[derive(Debug, Clone)]
pub struct TaskConfigurator {
    config: AcquisitionConfig,
}

impl TaskConfigurator {
    pub fn new(config: AcquisitionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn set_task_name(&mut self, name: impl Into<String>) {
        self.config.task_name = name.into();
    }

    pub fn add_channel(&mut self, physical_index: u8, sensor: SensorConfig) -> Result<(), ChannelError> {
        if !VALID_CHANNELS.contains(&physical_index) {
            return Err(ChannelError::InvalidChannel {
                index: physical_index,
                valid: VALID_CHANNELS.to_vec(),
            });
        }
        if self.config.channels.iter().any(|c| c.physical_index == physical_index) {
            return Err(ChannelError::DuplicateChannel(physical_index));
        }
        if self.config.channels.len() >= MAX_CHANNELS {
            return Err(ChannelError::TooManyChannels { max: MAX_CHANNELS });
        }

        self.config.channels.push(ChannelConfig { physical_index, sensor });
        log::debug!(
            "Channel ai{} added, task channels: {:?}",
            physical_index,
            self.config.channel_names()
        );
        Ok(())
    }

    /// Returns true if the channel was assigned
    pub fn remove_channel(&mut self, physical_index: u8) -> bool {
        let before = self.config.channels.len();
        self.config.channels.retain(|c| c.physical_index != physical_index);
        before != self.config.channels.len()
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) -> Result<usize, AcquisitionError> {
        let frame_size = Self::checked_frame_size(sample_rate, self.config.frame_duration_ms)?;
        self.config.sample_rate = sample_rate;
        Ok(frame_size)
    }

    pub fn set_frame_duration(&mut self, frame_duration_ms: u32) -> Result<usize, AcquisitionError> {
        let frame_size = Self::checked_frame_size(self.config.sample_rate, frame_duration_ms)?;
        self.config.frame_duration_ms = frame_duration_ms;
        Ok(frame_size)
    }

    pub fn set_buffer_rate(&mut self, buffer_rate: usize) -> Result<(), AcquisitionError> {
        if buffer_rate == 0 {
            return Err(AcquisitionError::InvalidTiming {
                sample_rate: self.config.sample_rate,
                frame_duration_ms: self.config.frame_duration_ms,
            });
        }
        self.config.buffer_rate = buffer_rate;
        Ok(())
    }

    fn checked_frame_size(sample_rate: f64, frame_duration_ms: u32) -> Result<usize, AcquisitionError> {
        let invalid = AcquisitionError::InvalidTiming { sample_rate, frame_duration_ms };
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(invalid);
        }
        match compute_frame_size(sample_rate, frame_duration_ms) {
            0 => Err(invalid),
            n => Ok(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configurator() -> TaskConfigurator {
        TaskConfigurator::new(AcquisitionConfig::from_settings(&AppConfig::default()))
    }

    fn accel() -> SensorConfig {
        SensorConfig::Accelerometer(AccelerometerConfig::default())
    }

    #[test]
    fn test_frame_size_rounding() {
        assert_eq!(compute_frame_size(12800.0, 100), 1280);
        assert_eq!(compute_frame_size(25600.0, 100), 2560);
        // 1652.9 * 0.1 = 165.29 rounds down, 1655.0 * 0.1 = 165.5 rounds up
        assert_eq!(compute_frame_size(1652.9, 100), 165);
        assert_eq!(compute_frame_size(1655.0, 100), 166);
    }

    #[test]
    fn test_driver_buffer_is_ten_frames() {
        let mut cfg = configurator();
        for (rate, duration) in [(12800.0, 100), (51200.0, 20), (2048.0, 1000), (1000.0, 3)] {
            cfg.set_sample_rate(rate).unwrap();
            cfg.set_frame_duration(duration).unwrap();
            let c = cfg.config();
            assert_eq!(c.frame_size(), (rate * duration as f64 / 1000.0).round() as usize);
            assert_eq!(c.driver_buffer_size(), c.frame_size() * 10);
        }
    }

    #[test]
    fn test_fifth_channel_rejected() {
        let mut cfg = configurator();
        for i in 0..4 {
            cfg.add_channel(i, accel()).unwrap();
        }
        let before = cfg.config().channels.clone();
        // every valid index is taken, so the duplicate check fires first
        assert!(cfg.add_channel(0, accel()).is_err());
        assert_eq!(cfg.config().channels, before);
    }

    #[test]
    fn test_too_many_channels_when_limit_reached() {
        let mut cfg = configurator();
        // four distinct channels fill the task; a fifth distinct index must
        // also be refused, which here can only be an invalid index
        for i in 0..4 {
            cfg.add_channel(i, accel()).unwrap();
        }
        assert_eq!(cfg.config().channel_count(), MAX_CHANNELS);
        assert!(matches!(
            cfg.add_channel(4, accel()),
            Err(ChannelError::InvalidChannel { index: 4, .. })
        ));
        assert_eq!(cfg.config().channel_count(), MAX_CHANNELS);
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let mut cfg = configurator();
        cfg.add_channel(2, accel()).unwrap();
        let err = cfg
            .add_channel(2, SensorConfig::Microphone(MicrophoneConfig::default()))
            .unwrap_err();
        assert_eq!(err, ChannelError::DuplicateChannel(2));
        assert_eq!(cfg.config().channel_count(), 1);
        assert_eq!(cfg.config().channels[0].sensor, accel());
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let mut cfg = configurator();
        assert!(matches!(
            cfg.add_channel(7, accel()),
            Err(ChannelError::InvalidChannel { index: 7, .. })
        ));
        assert!(cfg.config().channels.is_empty());
    }

    #[test]
    fn test_invalid_timing_leaves_config() {
        let mut cfg = configurator();
        let rate = cfg.config().sample_rate;
        assert!(cfg.set_sample_rate(0.0).is_err());
        assert!(cfg.set_sample_rate(f64::NAN).is_err());
        assert_eq!(cfg.config().sample_rate, rate);
        assert!(cfg.set_frame_duration(0).is_err());
        assert!(cfg.set_buffer_rate(0).is_err());
    }

    #[test]
    fn test_channel_names() {
        let channel = ChannelConfig { physical_index: 1, sensor: accel() };
        assert_eq!(channel.physical_channel("cDAQ1Mod1"), "cDAQ1Mod1/ai1");
        assert_eq!(channel.name("cDAQ1Mod1"), "cDAQ1Mod1-ch1-accelerometer");
    }

    #[test]
    fn test_remove_channel() {
        let mut cfg = configurator();
        cfg.add_channel(3, accel()).unwrap();
        assert!(cfg.remove_channel(3));
        assert!(!cfg.remove_channel(3));
        assert!(cfg.add_channel(3, accel()).is_ok());
    }

    #[test]
    fn test_sensor_kind_parsing() {
        assert!(matches!(SensorConfig::from_kind("mic"), Some(SensorConfig::Microphone(_))));
        assert!(matches!(SensorConfig::from_kind("Accel"), Some(SensorConfig::Accelerometer(_))));
        assert!(SensorConfig::from_kind("thermocouple").is_none());
    }
}
