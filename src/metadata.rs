//! # Recording Manifest Module
//!
//! Sidecar JSON document describing an active recording: where it came from,
//! how it was sampled and how many frames have landed on disk so far. The
//! manifest is rewritten as the recording grows, always through a temporary
//! file and a rename so a crash never leaves a half-written document.

use crate::acquisition::{AcquisitionConfig, SensorConfig};
use crate::error::WriterError;
use crate::recorder::WriterType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingManifest {
    pub machine_id: String,
    pub task_name: String,
    pub device: String,
    /// RFC 3339, local time
    pub start_time: String,
    pub sample_rate: f64,
    pub frame_duration_ms: u32,
    pub frame_size: usize,
    pub frame_count: u64,
    /// Files written by the segment writer; stays 0 for stream recordings
    pub segment_count: u64,
    pub channels: Vec<u8>,
    pub channel_names: Vec<String>,
    pub writer_type: WriterType,
    pub sensors: Vec<SensorConfig>,
    pub software_version: String,
}

impl RecordingManifest {
    pub fn new(config: &AcquisitionConfig, writer_type: WriterType) -> Self {
        Self {
            machine_id: machine_id(),
            task_name: config.task_name.clone(),
            device: config.device.clone(),
            start_time: chrono::Local::now().to_rfc3339(),
            sample_rate: config.sample_rate,
            frame_duration_ms: config.frame_duration_ms,
            frame_size: config.frame_size(),
            frame_count: 0,
            segment_count: 0,
            channels: config.channels.iter().map(|c| c.physical_index).collect(),
            channel_names: config.channel_names(),
            writer_type,
            sensors: config.channels.iter().map(|c| c.sensor.clone()).collect(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Host name of this machine, or "unknown"
pub fn machine_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Replace the manifest at `path` atomically
pub fn write_manifest(path: &Path, manifest: &RecordingManifest) -> Result<(), WriterError> {
    let json = serde_json::to_string_pretty(manifest)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    log::debug!(
        "Manifest {} updated: {} frames",
        path.display(),
        manifest.frame_count
    );
    Ok(())
}

#[allow(dead_code)]
pub fn read_manifest(path: &Path) -> Result<RecordingManifest, WriterError> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
