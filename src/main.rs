mod acquisition;
mod anomaly;
mod config;
mod driver;
mod engine;
mod error;
mod frame;
mod metadata;
mod recorder;
mod spectrum;
mod visualization;
mod wave_buffer;

use acquisition::SensorConfig;
use clap::Parser;
use config::AppConfig;
use driver::{SignalProfile, SimulatedDriver};
use engine::{AcquisitionEvent, Engine};
use recorder::{NamingPolicy, WriterType};
use std::path::PathBuf;
use std::time::Duration;
use visualization::DisplayFrame;

/// Continuous multi-channel acquisition with live buffers and optional recording
#[derive(Parser, Debug)]
#[command(name = "daq-stream", version)]
struct Args {
    /// Sample rate in Hz
    #[arg(long)]
    sample_rate: Option<f64>,

    /// Frame duration in milliseconds
    #[arg(long)]
    frame_duration: Option<u32>,

    /// Frames kept by the rolling buffers
    #[arg(long)]
    buffer_rate: Option<usize>,

    /// Display refresh interval in milliseconds
    #[arg(long)]
    update_interval: Option<u32>,

    /// Task name, also the prefix of timestamped recordings
    #[arg(long)]
    task_name: Option<String>,

    /// Channel as `<index>:<accel|mic>`, repeatable
    #[arg(long = "channel", value_parser = parse_channel)]
    channels: Vec<(u8, SensorConfig)>,

    /// Record while acquiring
    #[arg(long)]
    record: bool,

    /// Writer used with --record
    #[arg(long)]
    writer: Option<WriterType>,

    /// Exact recording file name instead of a timestamped one
    #[arg(long)]
    file_name: Option<String>,

    /// Directory for recordings
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Settings file (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peak amplitude of the simulated signal
    #[arg(long, default_value_t = 0.002)]
    amplitude: f64,
}

fn parse_channel(s: &str) -> Result<(u8, SensorConfig), String> {
    let (index, kind) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <index>:<accel|mic>, got '{}'", s))?;
    let index = index
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("bad channel index '{}': {}", index, e))?;
    let sensor = SensorConfig::from_kind(kind.trim())
        .ok_or_else(|| format!("unknown sensor '{}', expected accel or mic", kind))?;
    Ok((index, sensor))
}

/// Swap the command-line placeholder for the calibration stored in settings
fn calibrated(sensor: &SensorConfig, settings: &AppConfig) -> SensorConfig {
    match sensor {
        SensorConfig::Accelerometer(_) => SensorConfig::Accelerometer(settings.accelerometer.clone()),
        SensorConfig::Microphone(_) => SensorConfig::Microphone(settings.microphone.clone()),
    }
}

fn refresh(engine: &Engine, settings: &AppConfig) {
    let wave = engine.wave_snapshot();
    let spectrum = engine.spectrum_snapshot();
    let frequencies = engine.frequency_axis();
    let flag = engine.evaluate_anomaly();

    let display = DisplayFrame::build(
        &wave,
        &spectrum,
        &frequencies,
        settings.default_wave_downsample,
        settings.default_spectrum_downsample,
        flag,
    );

    log::info!(
        "frames {} (recorded {}) | mean |x| {:.5} | anomaly {} | peaks {:?} Hz | axis 0~{:?} Hz",
        engine.frames_delivered(),
        engine.frames_recorded(),
        anomaly::mean_abs_magnitude(&wave),
        flag,
        engine.peak_frequencies(),
        display.frequency_limit
    );
    if flag {
        log::warn!("Abnormal vibration, dominant frequencies {:?} Hz", display.markers);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let settings = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    let driver = SimulatedDriver::new(SignalProfile {
        amplitude: args.amplitude,
        ..SignalProfile::default()
    });
    let mut engine = Engine::from_settings(&settings, Box::new(driver));

    if let Some(name) = &args.task_name {
        engine.set_task_name(name.clone())?;
    }
    let channels = if args.channels.is_empty() {
        vec![(0, SensorConfig::Accelerometer(settings.accelerometer.clone()))]
    } else {
        args.channels.clone()
    };
    for (index, sensor) in &channels {
        engine.add_channel(*index, calibrated(sensor, &settings))?;
    }

    if let Some(rate) = args.sample_rate {
        if rate < settings.min_sample_rate || rate > settings.max_sample_rate {
            log::warn!(
                "Sample rate {} Hz is outside {} ~ {} Hz",
                rate,
                settings.min_sample_rate,
                settings.max_sample_rate
            );
        }
        engine.set_sample_rate(rate)?;
    }
    if let Some(ms) = args.frame_duration {
        engine.set_frame_duration(ms)?;
    }
    if let Some(frames) = args.buffer_rate {
        engine.set_buffer_rate(frames)?;
    }

    engine.create_task()?;

    let frame_duration = engine.config().frame_duration_ms;
    let update_ms = settings.clamp_update_interval(
        args.update_interval.unwrap_or(settings.max_update_interval_ms),
        frame_duration,
    );

    engine.start()?;

    if args.record {
        engine.set_writer_type(args.writer.unwrap_or(settings.default_writer_type))?;
        let directory = args
            .output_dir
            .clone()
            .unwrap_or_else(|| settings.default_write_file_dir.clone());
        let target = match &args.file_name {
            Some(name) => engine.enable_recording_as(&directory, NamingPolicy::Fixed(name.clone()))?,
            None => engine.enable_recording(&directory)?,
        };
        log::info!("Recording ({}) to {}", engine.writer_type(), target.display());
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(update_ms as u64));
    let deadline = args
        .duration
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                if deadline.map_or(false, |d| tokio::time::Instant::now() >= d) {
                    break;
                }
                let mut failed = false;
                while let Ok(event) = engine.events().try_recv() {
                    match event {
                        AcquisitionEvent::Failed(e) => {
                            log::error!("{}", e);
                            failed = true;
                        }
                        AcquisitionEvent::RecordingFailed(msg) => {
                            log::warn!("Recording stopped: {}", msg);
                        }
                    }
                }
                if failed {
                    break;
                }
                refresh(&engine, &settings);
            }
        }
    }

    if engine.is_recording() {
        let frames = engine.disable_recording()?;
        log::info!("Recording closed after {} frames", frames);
    }
    engine.stop()?;
    engine.clear_task()?;
    Ok(())
}
