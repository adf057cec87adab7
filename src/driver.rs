//! # Driver Boundary Module
//!
//! The vendor driver is an opaque collaborator: it owns the hardware, keeps
//! its own input buffer and calls back into the engine whenever one frame's
//! worth of samples per channel is available. This module defines that
//! capability set as a trait, plus a simulated implementation used by the
//! headless runner and by tests.
//!
//! ## Key Types
//! - `Driver`: Task creation, channel/timing configuration, handler registration, start/stop
//! - `FrameReader`: Handed to the frame handler; reads exactly one frame
//! - `DriverBuffer`: Bounded per-channel sample FIFO with sticky overflow
//! - `SimulatedDriver`: Background thread producing sine + noise at the configured rate
//!
//! ## Threading
//! The handler runs on the driver's own thread. The simulated driver never
//! holds its internal lock while the handler runs, so the engine may
//! reconfigure the driver while a delivery is waiting on engine locks.

use crate::acquisition::ChannelConfig;
use crate::error::AcquisitionError;
use crate::frame::Frame;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Reads one completed frame out of the driver's input buffer
pub trait FrameReader {
    /// Fill `dest` with the next frame. `dest` already has the armed shape.
    fn read_frame(&mut self, dest: &mut Frame) -> Result<(), AcquisitionError>;
}

/// Called by the driver, on its own thread, once per completed frame
pub type FrameHandler = Box<dyn FnMut(&mut dyn FrameReader) + Send>;

/// Capabilities the engine needs from a hardware driver
pub trait Driver: Send {
    fn create_task(&mut self, task_name: &str) -> Result<(), AcquisitionError>;
    fn add_channel(&mut self, device: &str, channel: &ChannelConfig) -> Result<(), AcquisitionError>;
    fn set_sample_rate(&mut self, sample_rate: f64) -> Result<(), AcquisitionError>;
    /// Samples per channel between handler invocations
    fn set_frame_size(&mut self, frame_size: usize) -> Result<(), AcquisitionError>;
    /// Capacity of the driver's input buffer, samples per channel
    fn set_input_buffer_size(&mut self, samples: usize) -> Result<(), AcquisitionError>;
    fn register_frame_handler(&mut self, handler: FrameHandler) -> Result<(), AcquisitionError>;
    fn start(&mut self) -> Result<(), AcquisitionError>;
    fn stop(&mut self) -> Result<(), AcquisitionError>;
    /// Release the task; channels and handler are forgotten
    fn close(&mut self) -> Result<(), AcquisitionError>;
}

/// Bounded per-channel FIFO standing in for the driver's input buffer
#[derive(Debug)]
pub struct DriverBuffer {
    channels: Vec<VecDeque<f64>>,
    capacity: usize,
    overflowed: bool,
}

impl DriverBuffer {
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            channels: (0..channels).map(|_| VecDeque::with_capacity(capacity)).collect(),
            capacity,
            overflowed: false,
        }
    }

    /// Append one block per channel. Exceeding capacity is sticky.
    pub fn push(&mut self, samples: &[Vec<f64>]) -> Result<(), AcquisitionError> {
        let incoming = samples.first().map(|s| s.len()).unwrap_or(0);
        if self.overflowed || self.available() + incoming > self.capacity {
            self.overflowed = true;
            return Err(AcquisitionError::Overflow { buffer_size: self.capacity });
        }
        for (queue, block) in self.channels.iter_mut().zip(samples) {
            queue.extend(block.iter().copied());
        }
        Ok(())
    }

    /// Samples waiting per channel
    pub fn available(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }
}

impl FrameReader for DriverBuffer {
    fn read_frame(&mut self, dest: &mut Frame) -> Result<(), AcquisitionError> {
        if self.overflowed {
            return Err(AcquisitionError::Overflow { buffer_size: self.capacity });
        }
        if dest.channels() != self.channels.len() {
            return Err(AcquisitionError::FrameShape {
                expected: (dest.channels(), dest.frame_size()),
                actual: (self.channels.len(), dest.frame_size()),
            });
        }
        let frame_size = dest.frame_size();
        if self.available() < frame_size {
            return Err(AcquisitionError::Driver(format!(
                "only {} of {} samples available",
                self.available(),
                frame_size
            )));
        }
        for (index, queue) in self.channels.iter_mut().enumerate() {
            for (dst, sample) in dest.channel_mut(index).iter_mut().zip(queue.drain(..frame_size)) {
                *dst = sample;
            }
        }
        Ok(())
    }
}

/// A frame already drained from the simulated buffer, handed over outside the lock
struct PendingFrame<'a>(&'a Frame);

impl FrameReader for PendingFrame<'_> {
    fn read_frame(&mut self, dest: &mut Frame) -> Result<(), AcquisitionError> {
        if dest.channels() != self.0.channels() || dest.frame_size() != self.0.frame_size() {
            // captured before a resize
            return Err(AcquisitionError::FrameShape {
                expected: (dest.channels(), dest.frame_size()),
                actual: (self.0.channels(), self.0.frame_size()),
            });
        }
        dest.copy_from(self.0);
        Ok(())
    }
}

struct OverflowReader {
    buffer_size: usize,
}

impl FrameReader for OverflowReader {
    fn read_frame(&mut self, _dest: &mut Frame) -> Result<(), AcquisitionError> {
        Err(AcquisitionError::Overflow { buffer_size: self.buffer_size })
    }
}

/// Signal produced by the simulated driver on every channel
#[derive(Debug, Clone)]
pub struct SignalProfile {
    /// Peak amplitude of the sine, in the channel's units
    pub amplitude: f64,
    /// Channel `n` oscillates at `(n + 1) * base_frequency` Hz
    pub base_frequency: f64,
    /// Uniform noise half-width
    pub noise: f64,
}

impl Default for SignalProfile {
    fn default() -> Self {
        Self {
            amplitude: 0.002,
            base_frequency: 120.0,
            noise: 0.0005,
        }
    }
}

struct SimState {
    task_name: Option<String>,
    channel_names: Vec<String>,
    sample_rate: f64,
    frame_size: usize,
    input_buffer_size: usize,
    buffer: DriverBuffer,
    handler: Option<FrameHandler>,
    profile: SignalProfile,
}

impl SimState {
    fn generate(&self, first_sample: u64, count: usize) -> Vec<Vec<f64>> {
        let mut rng = rand::thread_rng();
        (0..self.channel_names.len())
            .map(|channel| {
                let freq = self.profile.base_frequency * (channel + 1) as f64;
                (0..count)
                    .map(|i| {
                        let t = (first_sample + i as u64) as f64 / self.sample_rate;
                        let noise = if self.profile.noise > 0.0 {
                            rng.gen_range(-self.profile.noise..self.profile.noise)
                        } else {
                            0.0
                        };
                        self.profile.amplitude * (2.0 * std::f64::consts::PI * freq * t).sin() + noise
                    })
                    .collect()
            })
            .collect()
    }
}

/// Software stand-in for the vendor driver
pub struct SimulatedDriver {
    state: Arc<Mutex<SimState>>,
    running: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SimulatedDriver {
    pub fn new(profile: SignalProfile) -> Self {
        let state = SimState {
            task_name: None,
            channel_names: Vec::new(),
            sample_rate: 0.0,
            frame_size: 0,
            input_buffer_size: 0,
            buffer: DriverBuffer::new(0, 0),
            handler: None,
            profile,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    #[allow(dead_code)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
        state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquisition loop: produce samples paced by wall-clock time, deliver whole frames
    fn run(state: Arc<Mutex<SimState>>, running: Arc<AtomicBool>) {
        let started = Instant::now();
        let mut produced: u64 = 0;

        while running.load(Ordering::Acquire) {
            let frame_period = {
                let mut sim = Self::lock(&state);
                let due = (started.elapsed().as_secs_f64() * sim.sample_rate) as u64;
                if due > produced {
                    // never materialise more than one sample past capacity
                    let count = ((due - produced) as usize).min(sim.buffer.capacity() + 1);
                    let block = sim.generate(produced, count);
                    if let Err(e) = sim.buffer.push(&block) {
                        log::warn!("Simulated driver: {}", e);
                    }
                    produced = due;
                }
                Duration::from_secs_f64(sim.frame_size as f64 / sim.sample_rate.max(1.0))
            };

            if !Self::deliver_ready_frames(&state) {
                running.store(false, Ordering::Release);
                break;
            }

            thread::sleep((frame_period / 4).max(Duration::from_millis(1)));
        }
        log::debug!("Simulated driver: acquisition thread stopped");
    }

    /// Invoke the handler for every complete frame. Returns false once overflowed.
    fn deliver_ready_frames(state: &Arc<Mutex<SimState>>) -> bool {
        loop {
            let mut sim = Self::lock(state);
            let overflowed = sim.buffer.is_overflowed();
            let frame_size = sim.frame_size;
            if !overflowed && (frame_size == 0 || sim.buffer.available() < frame_size) {
                return true;
            }
            let Some(mut handler) = sim.handler.take() else {
                // nothing drains the buffer; it will overflow on its own
                return !overflowed;
            };

            if overflowed {
                let mut reader = OverflowReader { buffer_size: sim.buffer.capacity() };
                drop(sim);
                handler(&mut reader);
                Self::lock(state).handler = Some(handler);
                return false;
            }

            let mut frame = Frame::zeros(sim.channel_names.len(), frame_size);
            let drained = sim.buffer.read_frame(&mut frame);
            drop(sim);

            match drained {
                Ok(()) => handler(&mut PendingFrame(&frame)),
                Err(e) => log::warn!("Simulated driver: {}", e),
            }

            let mut sim = Self::lock(state);
            // a handler registered meanwhile wins
            if sim.handler.is_none() {
                sim.handler = Some(handler);
            }
        }
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(SignalProfile::default())
    }
}

impl Driver for SimulatedDriver {
    fn create_task(&mut self, task_name: &str) -> Result<(), AcquisitionError> {
        self.close()?;
        Self::lock(&self.state).task_name = Some(task_name.to_string());
        log::info!("Simulated driver: task '{}' created", task_name);
        Ok(())
    }

    fn add_channel(&mut self, device: &str, channel: &ChannelConfig) -> Result<(), AcquisitionError> {
        let mut sim = Self::lock(&self.state);
        if sim.task_name.is_none() {
            return Err(AcquisitionError::NotArmed);
        }
        sim.channel_names.push(channel.name(device));
        let (channels, capacity) = (sim.channel_names.len(), sim.input_buffer_size);
        sim.buffer = DriverBuffer::new(channels, capacity);
        log::debug!("Simulated driver: added {}", channel.physical_channel(device));
        Ok(())
    }

    fn set_sample_rate(&mut self, sample_rate: f64) -> Result<(), AcquisitionError> {
        Self::lock(&self.state).sample_rate = sample_rate;
        Ok(())
    }

    fn set_frame_size(&mut self, frame_size: usize) -> Result<(), AcquisitionError> {
        Self::lock(&self.state).frame_size = frame_size;
        Ok(())
    }

    fn set_input_buffer_size(&mut self, samples: usize) -> Result<(), AcquisitionError> {
        let mut sim = Self::lock(&self.state);
        sim.input_buffer_size = samples;
        let channels = sim.channel_names.len();
        sim.buffer = DriverBuffer::new(channels, samples);
        Ok(())
    }

    fn register_frame_handler(&mut self, handler: FrameHandler) -> Result<(), AcquisitionError> {
        Self::lock(&self.state).handler = Some(handler);
        Ok(())
    }

    fn start(&mut self) -> Result<(), AcquisitionError> {
        if self.is_running() {
            return Ok(());
        }
        {
            let sim = Self::lock(&self.state);
            if sim.task_name.is_none() || sim.channel_names.is_empty() {
                return Err(AcquisitionError::NotArmed);
            }
            if sim.sample_rate <= 0.0 || sim.frame_size == 0 {
                return Err(AcquisitionError::Driver("sample clock not configured".to_string()));
            }
        }
        // reap a thread that stopped itself after an overflow
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        self.running.store(true, Ordering::Release);
        let state = self.state.clone();
        let running = self.running.clone();
        self.worker = Some(thread::spawn(move || Self::run(state, running)));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AcquisitionError> {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            handle
                .join()
                .map_err(|_| AcquisitionError::Driver("acquisition thread panicked".to_string()))?;
        }
        let mut sim = Self::lock(&self.state);
        let (channels, capacity) = (sim.channel_names.len(), sim.input_buffer_size);
        sim.buffer = DriverBuffer::new(channels, capacity);
        Ok(())
    }

    fn close(&mut self) -> Result<(), AcquisitionError> {
        self.stop()?;
        let mut sim = Self::lock(&self.state);
        if let Some(name) = sim.task_name.take() {
            log::info!("Simulated driver: task '{}' closed", name);
        }
        sim.channel_names.clear();
        sim.handler = None;
        sim.buffer = DriverBuffer::new(0, sim.input_buffer_size);
        Ok(())
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
