//! # Error Types Module
//!
//! Centralized error handling for the acquisition engine.
//! Provides custom error types for each concern with proper context and error chaining.
//!
//! ## Error Types
//! - `ChannelError`: Invalid, duplicate or over-limit channel configuration
//! - `AcquisitionError`: Timing, driver and buffer overflow failures
//! - `WriterError`: Persistence failures, including out-of-sequence writer calls
//! - `ConfigError`: Configuration file I/O and parsing errors
//! - `EngineError`: Umbrella returned by `Engine` operations
//!
//! ## Usage Examples
//! ```rust
//! // Configurator rejects bad channels before the task is armed
//! pub fn add_channel(&mut self, physical_index: u8, sensor: SensorConfig) -> Result<(), ChannelError> { ... }
//!
//! // Writers reject calls made out of sequence
//! fn open(&mut self, directory: &Path, naming: &NamingPolicy) -> Result<PathBuf, WriterError> { ... }
//! ```
//!
//! ## Recoverability
//! Channel and writer errors are recoverable and never leave partial state.
//! `AcquisitionError::Overflow` is terminal for the running session: the task
//! has to be cleared and created again.

use std::fmt;
use std::path::PathBuf;

/// Errors raised while assigning physical channels to a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Physical channel already assigned to the task
    DuplicateChannel(u8),
    /// The device only has `max` analog inputs
    TooManyChannels { max: usize },
    /// Physical index outside the hardware's valid set
    InvalidChannel { index: u8, valid: Vec<u8> },
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::DuplicateChannel(index) => {
                write!(f, "Channel ai{} is already assigned to the task", index)
            }
            ChannelError::TooManyChannels { max } => {
                write!(f, "All {} channels have been added to the task", max)
            }
            ChannelError::InvalidChannel { index, valid } => {
                write!(f, "Illegal channel number {}. Legal channels: {:?}", index, valid)
            }
        }
    }
}

impl std::error::Error for ChannelError {}

/// Errors that can occur while acquiring frames
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    /// The driver's input buffer filled faster than frames were drained
    Overflow { buffer_size: usize },
    /// Operation requires a created task
    NotArmed,
    /// Channels cannot change while a task is armed
    TaskActive,
    /// The session already failed and must be cleared and recreated
    SessionFailed,
    /// Sample rate / frame duration combination cannot produce a frame
    InvalidTiming { sample_rate: f64, frame_duration_ms: u32 },
    /// Frame shape differs from the armed task's `[channels, frame_size]`
    FrameShape { expected: (usize, usize), actual: (usize, usize) },
    /// Error reported by the driver itself
    Driver(String),
}

impl fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionError::Overflow { buffer_size } => {
                write!(
                    f,
                    "Driver input buffer ({} samples per channel) overflowed; the task must be recreated",
                    buffer_size
                )
            }
            AcquisitionError::NotArmed => write!(f, "No task has been created"),
            AcquisitionError::TaskActive => {
                write!(f, "Clear the task before changing its channels")
            }
            AcquisitionError::SessionFailed => {
                write!(f, "Acquisition session failed; clear and recreate the task")
            }
            AcquisitionError::InvalidTiming { sample_rate, frame_duration_ms } => {
                write!(
                    f,
                    "Invalid timing: {} Hz with {} ms frames yields an empty frame",
                    sample_rate, frame_duration_ms
                )
            }
            AcquisitionError::FrameShape { expected, actual } => {
                write!(
                    f,
                    "Frame shape {:?} does not match the task's {:?}",
                    actual, expected
                )
            }
            AcquisitionError::Driver(msg) => write!(f, "Driver error: {}", msg),
        }
    }
}

impl std::error::Error for AcquisitionError {}

/// Errors that can occur while persisting frames
#[derive(Debug)]
pub enum WriterError {
    /// Writer method called out of sequence (double open, write after close, ...)
    WriterState(&'static str),
    /// Target file has the wrong suffix for the selected writer
    IllegalExtension { path: PathBuf, expected: &'static str },
    /// Filesystem failure
    Io(std::io::Error),
    /// Delimited text encoding failure
    Csv(csv::Error),
    /// Binary array file failure
    Hdf5(hdf5::Error),
    /// Manifest serialization failure
    Manifest(serde_json::Error),
    /// A recorded file does not have the expected layout
    Corrupt(String),
}

impl fmt::Display for WriterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterError::WriterState(msg) => write!(f, "Writer state error: {}", msg),
            WriterError::IllegalExtension { path, expected } => {
                write!(
                    f,
                    "Illegal file extension for {}, *.{} required",
                    path.display(),
                    expected
                )
            }
            WriterError::Io(e) => write!(f, "Recording I/O failed: {}", e),
            WriterError::Csv(e) => write!(f, "Failed to write CSV record: {}", e),
            WriterError::Hdf5(e) => write!(f, "Failed to write HDF5 segment: {}", e),
            WriterError::Manifest(e) => write!(f, "Failed to serialize manifest: {}", e),
            WriterError::Corrupt(msg) => write!(f, "Unreadable recording: {}", msg),
        }
    }
}

impl std::error::Error for WriterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriterError::Io(e) => Some(e),
            WriterError::Csv(e) => Some(e),
            WriterError::Hdf5(e) => Some(e),
            WriterError::Manifest(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WriterError {
    fn from(e: std::io::Error) -> Self {
        WriterError::Io(e)
    }
}

impl From<csv::Error> for WriterError {
    fn from(e: csv::Error) -> Self {
        WriterError::Csv(e)
    }
}

impl From<hdf5::Error> for WriterError {
    fn from(e: hdf5::Error) -> Self {
        WriterError::Hdf5(e)
    }
}

impl From<serde_json::Error> for WriterError {
    fn from(e: serde_json::Error) -> Self {
        WriterError::Manifest(e)
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
    /// A setting lies outside its allowed range
    OutOfRange { field: &'static str, value: f64, min: f64, max: f64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
            ConfigError::OutOfRange { field, value, min, max } => {
                write!(f, "{} = {} is outside {} ~ {}", field, value, min, max)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
            ConfigError::OutOfRange { .. } => None,
        }
    }
}

/// Errors returned by `Engine` operations
#[derive(Debug)]
pub enum EngineError {
    Channel(ChannelError),
    Acquisition(AcquisitionError),
    Writer(WriterError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Channel(e) => write!(f, "{}", e),
            EngineError::Acquisition(e) => write!(f, "{}", e),
            EngineError::Writer(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Channel(e) => Some(e),
            EngineError::Acquisition(e) => Some(e),
            EngineError::Writer(e) => Some(e),
        }
    }
}

impl From<ChannelError> for EngineError {
    fn from(e: ChannelError) -> Self {
        EngineError::Channel(e)
    }
}

impl From<AcquisitionError> for EngineError {
    fn from(e: AcquisitionError) -> Self {
        EngineError::Acquisition(e)
    }
}

impl From<WriterError> for EngineError {
    fn from(e: WriterError) -> Self {
        EngineError::Writer(e)
    }
}
