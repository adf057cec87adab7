//! # Acquisition Engine Module
//!
//! Session object tying the configurator, the driver, the rolling buffers,
//! the anomaly detector and the recorder together. There is no global
//! state: everything a frame delivery touches lives in one `FrameSource`
//! shared between the engine and the driver's callback.
//!
//! ## Execution Contexts
//! - **Driver callback**: `FrameSource::on_frame_ready`, once per frame, on the driver's thread
//! - **Presentation refresh**: `Engine` snapshot reads and `evaluate_anomaly`, on the caller's cadence
//!
//! ## Delivery Order
//! Under the receive-buffer lock: read one frame → wave buffer → spectrum
//! buffer → recorder queue (when recording). Resizes take the same lock, so
//! a frame is never delivered into half-resized buffers.
//!
//! ## Failure
//! A read error (driver overflow) marks the session failed and is reported
//! once through the event channel. Later deliveries are ignored until the
//! task is cleared and created again.

use crate::acquisition::{AcquisitionConfig, SensorConfig, TaskConfigurator};
use crate::anomaly::AnomalyDetector;
use crate::config::AppConfig;
use crate::driver::{Driver, FrameReader};
use crate::error::{AcquisitionError, EngineError, WriterError};
use crate::frame::Frame;
use crate::recorder::{NamingPolicy, Recorder, RecordingSpec, WriterType};
use crate::spectrum::SpectrumRingBuffer;
use crate::wave_buffer::{WaveRingBuffer, WaveSnapshot};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reported asynchronously from the callback and writer contexts
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    /// The acquisition session is dead; clear and recreate the task
    Failed(AcquisitionError),
    /// The recording was closed after a write error; acquisition continues
    RecordingFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Cleared,
    Armed,
    Running,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State touched by every frame delivery
pub struct FrameSource {
    /// Reused across deliveries; consumers copy out of it
    receive: Mutex<Frame>,
    wave: RwLock<WaveRingBuffer>,
    spectrum: RwLock<SpectrumRingBuffer>,
    anomaly: Mutex<AnomalyDetector>,
    recorder: Arc<Recorder>,
    frames: AtomicU64,
    failed: AtomicBool,
    events: Sender<AcquisitionEvent>,
}

impl FrameSource {
    fn new(
        config: &AcquisitionConfig,
        anomaly_threshold: f64,
        recorder: Arc<Recorder>,
        events: Sender<AcquisitionEvent>,
    ) -> Self {
        let (channels, frame_size) = (config.channel_count(), config.frame_size());
        Self {
            receive: Mutex::new(Frame::zeros(channels, frame_size)),
            wave: RwLock::new(WaveRingBuffer::new(channels, frame_size, config.buffer_rate)),
            spectrum: RwLock::new(SpectrumRingBuffer::new(
                channels,
                frame_size,
                config.sample_rate,
                config.buffer_rate,
            )),
            anomaly: Mutex::new(AnomalyDetector::new(anomaly_threshold)),
            recorder,
            frames: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            events,
        }
    }

    /// Entry point invoked by the driver once per completed frame
    pub fn on_frame_ready(&self, reader: &mut dyn FrameReader) {
        if self.failed.load(Ordering::Acquire) {
            return;
        }
        let mut receive = lock(&self.receive);

        match reader.read_frame(&mut receive) {
            Ok(()) => {}
            Err(AcquisitionError::FrameShape { expected, actual }) => {
                log::debug!(
                    "Discarding {:?} frame captured before resize to {:?}",
                    actual,
                    expected
                );
                return;
            }
            Err(e) => {
                drop(receive);
                self.fail(e);
                return;
            }
        }

        if let Err(e) = write(&self.wave).push(&receive) {
            log::warn!("Wave buffer rejected frame: {}", e);
            return;
        }
        if let Err(e) = write(&self.spectrum).push(&receive) {
            log::warn!("Spectrum buffer rejected frame: {}", e);
            return;
        }
        self.recorder.submit(&receive);

        let delivered = self.frames.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("Frame {} delivered", delivered);
    }

    fn fail(&self, error: AcquisitionError) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            log::error!("Acquisition failed: {}", error);
            let _ = self.events.send(AcquisitionEvent::Failed(error));
        }
    }

    /// Reshape every buffer. Caller holds the receive lock.
    fn reset_buffers(&self, receive: &mut Frame, config: &AcquisitionConfig) {
        let (channels, frame_size) = (config.channel_count(), config.frame_size());
        receive.resize(channels, frame_size);
        write(&self.wave).reset(channels, frame_size, config.buffer_rate);
        write(&self.spectrum).reset(channels, frame_size, config.sample_rate, config.buffer_rate);
        log::debug!(
            "Buffers sized: {} channels x {} samples, {} frames of history",
            channels,
            frame_size,
            config.buffer_rate
        );
    }
}

/// Acquisition session: configuration, driver, buffers and recording
pub struct Engine {
    configurator: TaskConfigurator,
    driver: Box<dyn Driver>,
    source: Arc<FrameSource>,
    recorder: Arc<Recorder>,
    writer_type: WriterType,
    state: TaskState,
    events: Receiver<AcquisitionEvent>,
}

impl Engine {
    pub fn new(config: AcquisitionConfig, driver: Box<dyn Driver>, anomaly_threshold: f64) -> Self {
        let (events_tx, events_rx) = unbounded();
        let recorder = Arc::new(Recorder::new(events_tx.clone()));
        let source = Arc::new(FrameSource::new(
            &config,
            anomaly_threshold,
            recorder.clone(),
            events_tx,
        ));
        Self {
            configurator: TaskConfigurator::new(config),
            driver,
            source,
            recorder,
            writer_type: WriterType::Stream,
            state: TaskState::Cleared,
            events: events_rx,
        }
    }

    pub fn from_settings(settings: &AppConfig, driver: Box<dyn Driver>) -> Self {
        let mut engine = Self::new(
            AcquisitionConfig::from_settings(settings),
            driver,
            settings.anomaly_threshold,
        );
        engine.writer_type = settings.default_writer_type;
        engine
    }

    pub fn config(&self) -> &AcquisitionConfig {
        self.configurator.config()
    }

    #[allow(dead_code)]
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.source.failed.load(Ordering::Acquire)
    }

    pub fn set_task_name(&mut self, name: impl Into<String>) -> Result<(), EngineError> {
        self.require_cleared()?;
        self.configurator.set_task_name(name);
        Ok(())
    }

    pub fn add_channel(&mut self, physical_index: u8, sensor: SensorConfig) -> Result<(), EngineError> {
        self.require_cleared()?;
        self.configurator.add_channel(physical_index, sensor)?;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn remove_channel(&mut self, physical_index: u8) -> Result<bool, EngineError> {
        self.require_cleared()?;
        Ok(self.configurator.remove_channel(physical_index))
    }

    fn require_cleared(&self) -> Result<(), EngineError> {
        match self.state {
            TaskState::Cleared => Ok(()),
            _ => Err(AcquisitionError::TaskActive.into()),
        }
    }

    /// Arm the driver with the configured channels and timing
    pub fn create_task(&mut self) -> Result<(), EngineError> {
        if self.state != TaskState::Cleared {
            self.clear_task()?;
        }
        let config = self.configurator.config().clone();
        if config.channels.is_empty() {
            return Err(AcquisitionError::Driver("task has no channels".to_string()).into());
        }

        if let Err(e) = self.arm(&config) {
            if let Err(close_err) = self.driver.close() {
                log::warn!("Failed to close driver after arm error: {}", close_err);
            }
            return Err(e.into());
        }
        self.state = TaskState::Armed;

        log::info!(
            "Task '{}' created: {:?} at {} Hz, {} ms frames ({} samples), driver buffer {}",
            config.task_name,
            config.channel_names(),
            config.sample_rate,
            config.frame_duration_ms,
            config.frame_size(),
            config.driver_buffer_size()
        );
        log::info!(
            "Rolling buffers hold {} samples per channel ({} ms), {} spectrum bins",
            config.wave_buffer_len(),
            config.buffer_duration_ms(),
            config.spectrum_bins()
        );
        Ok(())
    }

    fn arm(&mut self, config: &AcquisitionConfig) -> Result<(), AcquisitionError> {
        self.driver.create_task(&config.task_name)?;
        self.driver.set_input_buffer_size(config.driver_buffer_size())?;
        for channel in &config.channels {
            self.driver.add_channel(&config.device, channel)?;
            log::debug!(
                "{} measures {}",
                channel.physical_channel(&config.device),
                channel.sensor.units()
            );
        }
        self.driver.set_sample_rate(config.sample_rate)?;
        self.driver.set_frame_size(config.frame_size())?;

        {
            let mut receive = lock(&self.source.receive);
            self.source.reset_buffers(&mut receive, config);
        }
        lock(&self.source.anomaly).reset();
        self.source.frames.store(0, Ordering::Release);
        self.source.failed.store(false, Ordering::Release);
        // stale failures belong to the previous task
        while self.events.try_recv().is_ok() {}

        let source = self.source.clone();
        self.driver
            .register_frame_handler(Box::new(move |reader: &mut dyn FrameReader| {
                source.on_frame_ready(reader)
            }))
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        match self.state {
            TaskState::Cleared => return Err(AcquisitionError::NotArmed.into()),
            TaskState::Running => return Ok(()),
            TaskState::Armed => {}
        }
        if self.is_failed() {
            return Err(AcquisitionError::SessionFailed.into());
        }
        self.driver.start()?;
        self.state = TaskState::Running;
        log::info!("Task '{}' started", self.config().task_name);
        Ok(())
    }

    /// Stop delivery, then close any recording. Buffers keep their contents.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        if self.state == TaskState::Running {
            self.driver.stop()?;
            self.state = TaskState::Armed;
            log::info!(
                "Task '{}' stopped after {} frames",
                self.config().task_name,
                self.frames_delivered()
            );
        }
        self.recorder.stop()?;
        Ok(())
    }

    pub fn clear_task(&mut self) -> Result<(), EngineError> {
        if self.state == TaskState::Cleared {
            return Ok(());
        }
        let stopped = self.stop();
        self.driver.close()?;
        self.state = TaskState::Cleared;
        log::info!("Task '{}' cleared", self.config().task_name);
        stopped
    }

    /// Returns the new frame size. Refused while recording.
    pub fn set_sample_rate(&mut self, sample_rate: f64) -> Result<usize, EngineError> {
        self.require_not_recording()?;
        let mut staged = self.configurator.clone();
        let frame_size = staged.set_sample_rate(sample_rate)?;
        self.apply_timing(staged)?;
        Ok(frame_size)
    }

    /// Returns the new frame size. Refused while recording.
    pub fn set_frame_duration(&mut self, frame_duration_ms: u32) -> Result<usize, EngineError> {
        self.require_not_recording()?;
        let mut staged = self.configurator.clone();
        let frame_size = staged.set_frame_duration(frame_duration_ms)?;
        self.apply_timing(staged)?;
        Ok(frame_size)
    }

    pub fn set_buffer_rate(&mut self, buffer_rate: usize) -> Result<(), EngineError> {
        self.configurator.set_buffer_rate(buffer_rate)?;
        if self.state != TaskState::Cleared {
            let mut receive = lock(&self.source.receive);
            self.source.reset_buffers(&mut receive, self.configurator.config());
        }
        Ok(())
    }

    /// Push staged timing to an armed driver and resize under the receive
    /// lock. The configurator only takes the staged values once the driver
    /// accepted them.
    fn apply_timing(&mut self, staged: TaskConfigurator) -> Result<(), AcquisitionError> {
        if self.state != TaskState::Cleared {
            let config = staged.config();
            let mut receive = lock(&self.source.receive);
            if let Err(e) = push_timing(&mut *self.driver, config) {
                if let Err(restore) = push_timing(&mut *self.driver, self.configurator.config()) {
                    log::warn!("Failed to restore driver timing: {}", restore);
                }
                return Err(e);
            }
            self.source.reset_buffers(&mut receive, config);
            log::info!(
                "Timing changed: {} Hz, {} ms frames ({} samples)",
                config.sample_rate,
                config.frame_duration_ms,
                config.frame_size()
            );
        }
        self.configurator = staged;
        Ok(())
    }

    fn require_not_recording(&self) -> Result<(), WriterError> {
        if self.recorder.is_recording() {
            Err(WriterError::WriterState("stop recording first"))
        } else {
            Ok(())
        }
    }

    pub fn writer_type(&self) -> WriterType {
        self.writer_type
    }

    pub fn set_writer_type(&mut self, writer_type: WriterType) -> Result<(), EngineError> {
        if self.recorder.is_recording() {
            return Err(WriterError::WriterState("cannot switch writer type while recording").into());
        }
        self.writer_type = writer_type;
        Ok(())
    }

    /// Start recording into `directory` with a timestamped name
    pub fn enable_recording(&mut self, directory: impl AsRef<Path>) -> Result<PathBuf, EngineError> {
        let naming = NamingPolicy::timestamped(self.config().task_name.clone(), self.writer_type);
        self.enable_recording_as(directory, naming)
    }

    pub fn enable_recording_as(
        &mut self,
        directory: impl AsRef<Path>,
        naming: NamingPolicy,
    ) -> Result<PathBuf, EngineError> {
        if self.state == TaskState::Cleared {
            return Err(AcquisitionError::NotArmed.into());
        }
        let spec = RecordingSpec {
            writer_type: self.writer_type,
            directory: directory.as_ref().to_path_buf(),
            naming,
            config: self.config().clone(),
        };
        Ok(self.recorder.start(spec)?)
    }

    /// Close the recording; acquisition keeps running. Returns frames written.
    pub fn disable_recording(&mut self) -> Result<u64, EngineError> {
        Ok(self.recorder.stop()?)
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn frames_recorded(&self) -> u64 {
        self.recorder.frames_recorded()
    }

    pub fn wave_snapshot(&self) -> WaveSnapshot {
        read(&self.source.wave).read()
    }

    /// Per-channel spectrum averaged over the ring
    pub fn spectrum_snapshot(&self) -> Vec<Vec<f64>> {
        read(&self.source.spectrum).read()
    }

    pub fn frequency_axis(&self) -> Vec<f64> {
        read(&self.source.spectrum).frequency_axis().to_vec()
    }

    pub fn peak_frequencies(&self) -> Vec<Option<f64>> {
        read(&self.source.spectrum).peak_frequencies()
    }

    /// Samples per channel held by the wave buffer
    #[allow(dead_code)]
    pub fn buffer_len(&self) -> usize {
        read(&self.source.wave).len()
    }

    #[allow(dead_code)]
    pub fn anomaly_flag(&self) -> bool {
        lock(&self.source.anomaly).flag()
    }

    /// One detector step over the current wave buffer
    pub fn evaluate_anomaly(&self) -> bool {
        let snapshot = self.wave_snapshot();
        lock(&self.source.anomaly).evaluate(&snapshot)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.source.frames.load(Ordering::Acquire)
    }

    pub fn events(&self) -> &Receiver<AcquisitionEvent> {
        &self.events
    }
}

fn push_timing(driver: &mut dyn Driver, config: &AcquisitionConfig) -> Result<(), AcquisitionError> {
    driver.set_sample_rate(config.sample_rate)?;
    driver.set_frame_size(config.frame_size())?;
    driver.set_input_buffer_size(config.driver_buffer_size())
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.clear_task() {
            log::warn!("Failed to clear task on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{AccelerometerConfig, MicrophoneConfig};
    use crate::driver::{FrameHandler, SignalProfile, SimulatedDriver};
    use crate::recorder::read_stream_file;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    /// Driver whose frames are pushed by the test itself
    #[derive(Clone, Default)]
    struct ManualDriver {
        handler: Arc<Mutex<Option<FrameHandler>>>,
        calls: Arc<Mutex<Vec<String>>>,
        /// `set_frame_size` refuses this size
        reject_frame_size: Arc<Mutex<Option<usize>>>,
    }

    struct FrameCopy<'a>(&'a Frame);

    impl FrameReader for FrameCopy<'_> {
        fn read_frame(&mut self, dest: &mut Frame) -> Result<(), AcquisitionError> {
            if dest.channels() != self.0.channels() || dest.frame_size() != self.0.frame_size() {
                return Err(AcquisitionError::FrameShape {
                    expected: (dest.channels(), dest.frame_size()),
                    actual: (self.0.channels(), self.0.frame_size()),
                });
            }
            dest.copy_from(self.0);
            Ok(())
        }
    }

    struct Failing(AcquisitionError);

    impl FrameReader for Failing {
        fn read_frame(&mut self, _dest: &mut Frame) -> Result<(), AcquisitionError> {
            Err(self.0.clone())
        }
    }

    impl ManualDriver {
        fn deliver(&self, frame: &Frame) {
            self.deliver_with(&mut FrameCopy(frame));
        }

        fn deliver_with(&self, reader: &mut dyn FrameReader) {
            let mut handler = self.handler.lock().unwrap();
            let handler = handler.as_mut().expect("handler registered");
            handler(reader);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Driver for ManualDriver {
        fn create_task(&mut self, task_name: &str) -> Result<(), AcquisitionError> {
            self.log(format!("create_task {}", task_name));
            Ok(())
        }
        fn add_channel(&mut self, device: &str, channel: &crate::acquisition::ChannelConfig) -> Result<(), AcquisitionError> {
            self.log(format!("add_channel {}", channel.physical_channel(device)));
            Ok(())
        }
        fn set_sample_rate(&mut self, sample_rate: f64) -> Result<(), AcquisitionError> {
            self.log(format!("set_sample_rate {}", sample_rate));
            Ok(())
        }
        fn set_frame_size(&mut self, frame_size: usize) -> Result<(), AcquisitionError> {
            self.log(format!("set_frame_size {}", frame_size));
            if *self.reject_frame_size.lock().unwrap() == Some(frame_size) {
                return Err(AcquisitionError::Driver(format!("frame size {} refused", frame_size)));
            }
            Ok(())
        }
        fn set_input_buffer_size(&mut self, samples: usize) -> Result<(), AcquisitionError> {
            self.log(format!("set_input_buffer_size {}", samples));
            Ok(())
        }
        fn register_frame_handler(&mut self, handler: FrameHandler) -> Result<(), AcquisitionError> {
            *self.handler.lock().unwrap() = Some(handler);
            Ok(())
        }
        fn start(&mut self) -> Result<(), AcquisitionError> {
            self.log("start".to_string());
            Ok(())
        }
        fn stop(&mut self) -> Result<(), AcquisitionError> {
            self.log("stop".to_string());
            Ok(())
        }
        fn close(&mut self) -> Result<(), AcquisitionError> {
            self.log("close".to_string());
            Ok(())
        }
    }

    fn accel() -> SensorConfig {
        SensorConfig::Accelerometer(AccelerometerConfig::default())
    }

    /// 1 kHz, 4 ms frames → 4 samples; 3 frames of history
    fn small_config() -> AcquisitionConfig {
        let mut config = AcquisitionConfig::from_settings(&AppConfig::default());
        config.sample_rate = 1000.0;
        config.frame_duration_ms = 4;
        config.buffer_rate = 3;
        config
    }

    fn manual_engine() -> (Engine, ManualDriver) {
        let driver = ManualDriver::default();
        let mut engine = Engine::new(small_config(), Box::new(driver.clone()), 0.005);
        engine.add_channel(0, accel()).unwrap();
        (engine, driver)
    }

    fn constant(value: f64, channels: usize, frame_size: usize) -> Frame {
        Frame::from_channels(vec![vec![value; frame_size]; channels])
    }

    #[test]
    fn test_create_task_arms_driver() {
        let (mut engine, driver) = manual_engine();
        engine.add_channel(3, SensorConfig::Microphone(MicrophoneConfig::default())).unwrap();
        engine.create_task().unwrap();

        assert_eq!(engine.state(), TaskState::Armed);
        let calls = driver.calls();
        assert_eq!(calls[0], "create_task daq_task");
        assert!(calls.contains(&"set_input_buffer_size 40".to_string()));
        assert!(calls.contains(&"add_channel cDAQ1Mod1/ai3".to_string()));
        assert!(calls.contains(&"set_frame_size 4".to_string()));
        assert_eq!(engine.buffer_len(), 12);
        assert_eq!(engine.wave_snapshot().len(), 2);
        assert_eq!(engine.frequency_axis(), vec![0.0, 250.0, 500.0]);
    }

    #[test]
    fn test_channels_locked_while_armed() {
        let (mut engine, _driver) = manual_engine();
        engine.create_task().unwrap();
        assert!(matches!(
            engine.add_channel(1, accel()),
            Err(EngineError::Acquisition(AcquisitionError::TaskActive))
        ));
        engine.clear_task().unwrap();
        engine.add_channel(1, accel()).unwrap();
        assert_eq!(engine.config().channel_count(), 2);
    }

    #[test]
    fn test_rejected_channel_leaves_config_unchanged() {
        let (mut engine, _driver) = manual_engine();
        assert!(matches!(engine.add_channel(0, accel()), Err(EngineError::Channel(_))));
        assert!(matches!(engine.add_channel(9, accel()), Err(EngineError::Channel(_))));
        assert_eq!(engine.config().channel_count(), 1);
    }

    #[test]
    fn test_frames_flow_into_buffers() {
        let (mut engine, driver) = manual_engine();
        engine.create_task().unwrap();
        engine.start().unwrap();

        for v in 1..=4 {
            driver.deliver(&constant(v as f64, 1, 4));
        }
        assert_eq!(engine.frames_delivered(), 4);
        assert_eq!(
            engine.wave_snapshot()[0],
            vec![2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0, 4.0, 4.0, 4.0, 4.0]
        );
        // constant frames carry only DC, which is zeroed
        assert!(engine.spectrum_snapshot()[0].iter().all(|v| *v == 0.0));
        assert_eq!(engine.peak_frequencies(), vec![None]);
    }

    #[test]
    fn test_anomaly_evaluated_on_refresh() {
        let (mut engine, driver) = manual_engine();
        engine.create_task().unwrap();
        engine.start().unwrap();
        driver.deliver(&constant(1.0, 1, 4));

        for _ in 0..4 {
            assert!(!engine.evaluate_anomaly());
        }
        assert!(engine.evaluate_anomaly());
        assert!(engine.anomaly_flag());
    }

    #[test]
    fn test_overflow_fails_session_once() {
        let (mut engine, driver) = manual_engine();
        engine.create_task().unwrap();
        engine.start().unwrap();
        driver.deliver(&constant(1.0, 1, 4));
        let before = engine.wave_snapshot();

        let overflow = AcquisitionError::Overflow { buffer_size: 40 };
        driver.deliver_with(&mut Failing(overflow.clone()));
        driver.deliver_with(&mut Failing(overflow.clone()));
        driver.deliver(&constant(5.0, 1, 4));

        assert!(engine.is_failed());
        assert_eq!(engine.wave_snapshot(), before);
        assert_eq!(engine.frames_delivered(), 1);
        assert_eq!(engine.events().try_recv(), Ok(AcquisitionEvent::Failed(overflow)));
        assert!(engine.events().try_recv().is_err());

        engine.stop().unwrap();
        assert!(matches!(
            engine.start(),
            Err(EngineError::Acquisition(AcquisitionError::SessionFailed))
        ));

        // recreating the task recovers
        engine.create_task().unwrap();
        assert!(!engine.is_failed());
        engine.start().unwrap();
    }

    #[test]
    fn test_resize_while_armed() {
        let (mut engine, driver) = manual_engine();
        engine.create_task().unwrap();
        engine.start().unwrap();
        driver.deliver(&constant(1.0, 1, 4));

        assert_eq!(engine.set_frame_duration(8).unwrap(), 8);
        assert_eq!(engine.buffer_len(), 24);
        assert!(driver.calls().contains(&"set_input_buffer_size 80".to_string()));
        assert!(engine.wave_snapshot()[0].iter().all(|v| *v == 0.0));

        // a frame captured before the resize is dropped, not failed
        driver.deliver(&constant(1.0, 1, 4));
        assert!(!engine.is_failed());
        assert_eq!(engine.frames_delivered(), 1);

        driver.deliver(&constant(2.0, 1, 8));
        assert_eq!(engine.frames_delivered(), 2);

        assert!(engine.set_sample_rate(0.0).is_err());
        assert_eq!(engine.config().sample_rate, 1000.0);

        engine.set_buffer_rate(5).unwrap();
        assert_eq!(engine.buffer_len(), 40);
    }

    #[test]
    fn test_refused_timing_leaves_engine_unchanged() {
        let (mut engine, driver) = manual_engine();
        engine.create_task().unwrap();
        engine.start().unwrap();
        *driver.reject_frame_size.lock().unwrap() = Some(8);

        assert!(matches!(
            engine.set_frame_duration(8),
            Err(EngineError::Acquisition(AcquisitionError::Driver(_)))
        ));
        assert_eq!(engine.config().frame_duration_ms, 4);
        assert_eq!(engine.config().frame_size(), 4);
        assert_eq!(engine.buffer_len(), 12);
        assert_eq!(engine.frequency_axis(), vec![0.0, 250.0, 500.0]);
        // driver is put back on the old frame size
        let last = driver.calls().into_iter().filter(|c| c.starts_with("set_frame_size")).last();
        assert_eq!(last.as_deref(), Some("set_frame_size 4"));

        // 2 kHz at 4 ms is also 8 samples
        assert!(engine.set_sample_rate(2000.0).is_err());
        assert_eq!(engine.config().sample_rate, 1000.0);

        driver.deliver(&constant(1.0, 1, 4));
        assert_eq!(engine.frames_delivered(), 1);
        assert!(!engine.is_failed());
    }

    #[test]
    fn test_failed_arm_closes_driver() {
        let (mut engine, driver) = manual_engine();
        *driver.reject_frame_size.lock().unwrap() = Some(4);

        assert!(engine.create_task().is_err());
        assert_eq!(engine.state(), TaskState::Cleared);
        assert_eq!(driver.calls().last().map(String::as_str), Some("close"));
        assert!(matches!(
            engine.start(),
            Err(EngineError::Acquisition(AcquisitionError::NotArmed))
        ));
    }

    #[test]
    fn test_snapshots_never_see_partial_frames() {
        let (mut engine, driver) = manual_engine();
        engine.create_task().unwrap();
        engine.start().unwrap();

        let producer = {
            let driver = driver.clone();
            thread::spawn(move || {
                for v in 1..=500 {
                    driver.deliver(&constant(v as f64, 1, 4));
                }
            })
        };

        let mut reads = 0;
        while !producer.is_finished() || reads == 0 {
            let wave = engine.wave_snapshot();
            assert_eq!(wave[0].len(), 12);
            let mut previous = 0.0;
            for run in wave[0].chunks(4) {
                assert!(run.iter().all(|v| *v == run[0]), "partial frame in {:?}", wave[0]);
                assert!(run[0] >= previous, "out of order: {:?}", wave[0]);
                previous = run[0];
            }

            let spectrum = engine.spectrum_snapshot();
            assert_eq!(spectrum.len(), 1);
            assert_eq!(spectrum[0].len(), 3);
            reads += 1;
        }
        producer.join().unwrap();

        assert_eq!(engine.frames_delivered(), 500);
        assert_eq!(
            engine.wave_snapshot()[0],
            vec![498.0, 498.0, 498.0, 498.0, 499.0, 499.0, 499.0, 499.0, 500.0, 500.0, 500.0, 500.0]
        );
    }

    #[test]
    fn test_remove_channel_only_when_cleared() {
        let (mut engine, _driver) = manual_engine();
        engine.create_task().unwrap();
        assert!(matches!(
            engine.remove_channel(0),
            Err(EngineError::Acquisition(AcquisitionError::TaskActive))
        ));
        engine.clear_task().unwrap();
        assert!(engine.remove_channel(0).unwrap());
        assert_eq!(engine.config().channel_count(), 0);
    }

    #[test]
    fn test_recording_toggles_without_stopping() {
        let dir = tempdir().unwrap();
        let (mut engine, driver) = manual_engine();
        assert!(engine.enable_recording(dir.path()).is_err());
        engine.create_task().unwrap();
        engine.start().unwrap();

        driver.deliver(&constant(-1.0, 1, 4));
        let path = engine.enable_recording(dir.path()).unwrap();
        assert!(engine.is_recording());
        assert!(matches!(
            engine.set_writer_type(WriterType::Segment),
            Err(EngineError::Writer(WriterError::WriterState(_)))
        ));
        assert!(engine.set_frame_duration(8).is_err());

        for v in 0..3 {
            driver.deliver(&constant(v as f64, 1, 4));
        }
        assert_eq!(engine.disable_recording().unwrap(), 3);
        driver.deliver(&constant(9.0, 1, 4));

        assert_eq!(engine.state(), TaskState::Running);
        assert_eq!(engine.frames_delivered(), 5);
        let recorded = read_stream_file(&path, 4).unwrap();
        let expected: Vec<Frame> = (0..3).map(|v| constant(v as f64, 1, 4)).collect();
        assert_eq!(recorded, expected);

        engine.set_writer_type(WriterType::Segment).unwrap();
    }

    #[test]
    fn test_stop_closes_recording() {
        let dir = tempdir().unwrap();
        let (mut engine, driver) = manual_engine();
        engine.create_task().unwrap();
        engine.start().unwrap();
        engine.enable_recording(dir.path()).unwrap();
        driver.deliver(&constant(1.0, 1, 4));

        engine.stop().unwrap();
        assert!(!engine.is_recording());
        assert_eq!(engine.frames_recorded(), 1);
        assert!(driver.calls().contains(&"stop".to_string()));

        engine.clear_task().unwrap();
        engine.clear_task().unwrap();
        assert_eq!(driver.calls().iter().filter(|c| *c == "close").count(), 1);
    }

    #[test]
    fn test_simulated_driver_end_to_end() {
        let driver = SimulatedDriver::new(SignalProfile {
            amplitude: 1.0,
            base_frequency: 250.0,
            noise: 0.0,
        });
        let mut config = small_config();
        config.frame_duration_ms = 20;
        let mut engine = Engine::new(config, Box::new(driver), 0.005);
        engine.add_channel(0, accel()).unwrap();
        engine.create_task().unwrap();
        engine.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.frames_delivered() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        engine.stop().unwrap();

        assert!(engine.frames_delivered() >= 3);
        assert!(!engine.is_failed());
        // 20 samples at 1 kHz → 50 Hz bins; the 250 Hz tone lands on bin 5
        assert_eq!(engine.peak_frequencies(), vec![Some(250.0)]);
        engine.clear_task().unwrap();
    }
}
