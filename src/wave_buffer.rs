//! # Rolling Wave Buffer Module
//!
//! Fixed-capacity per-channel history of the most recent `buffer_rate`
//! frames, used for the live waveform display and the anomaly statistic.
//!
//! ## Layout
//! Storage is a ring of frame-sized slots per channel. `push` overwrites the
//! oldest slot and advances the write offset, so each delivery costs one
//! frame copy regardless of history length. `read` linearises the ring into
//! an owned, time-ordered copy (oldest → newest). The total length never
//! changes between `reset` calls.

use crate::error::AcquisitionError;
use crate::frame::Frame;

/// Per-channel samples, oldest first
pub type WaveSnapshot = Vec<Vec<f64>>;

#[derive(Debug, Clone)]
pub struct WaveRingBuffer {
    data: Vec<Vec<f64>>,
    frame_size: usize,
    buffer_rate: usize,
    /// Slot that the next frame overwrites (holds the oldest frame once full)
    head: usize,
}

impl WaveRingBuffer {
    pub fn new(channels: usize, frame_size: usize, buffer_rate: usize) -> Self {
        let mut buffer = Self {
            data: Vec::new(),
            frame_size: 0,
            buffer_rate: 0,
            head: 0,
        };
        buffer.reset(channels, frame_size, buffer_rate);
        buffer
    }

    /// Reallocate to `buffer_rate * frame_size` samples per channel and zero-fill
    pub fn reset(&mut self, channels: usize, frame_size: usize, buffer_rate: usize) {
        let total = frame_size * buffer_rate;
        self.data = vec![vec![0.0; total]; channels];
        self.frame_size = frame_size;
        self.buffer_rate = buffer_rate;
        self.head = 0;
    }

    /// Discard the oldest frame and append `frame` as the newest
    pub fn push(&mut self, frame: &Frame) -> Result<(), AcquisitionError> {
        if frame.channels() != self.data.len() || frame.frame_size() != self.frame_size {
            return Err(AcquisitionError::FrameShape {
                expected: (self.data.len(), self.frame_size),
                actual: (frame.channels(), frame.frame_size()),
            });
        }
        if self.buffer_rate == 0 {
            return Ok(());
        }

        let start = self.head * self.frame_size;
        for (channel, history) in self.data.iter_mut().enumerate() {
            history[start..start + self.frame_size].copy_from_slice(frame.channel(channel));
        }
        self.head = (self.head + 1) % self.buffer_rate;
        Ok(())
    }

    /// Time-ordered copy of every channel
    pub fn read(&self) -> WaveSnapshot {
        let split = self.head * self.frame_size;
        self.data
            .iter()
            .map(|history| {
                let mut ordered = Vec::with_capacity(history.len());
                ordered.extend_from_slice(&history[split..]);
                ordered.extend_from_slice(&history[..split]);
                ordered
            })
            .collect()
    }

    /// Samples per channel
    pub fn len(&self) -> usize {
        self.frame_size * self.buffer_rate
    }

    #[cfg(test)]
    pub fn channels(&self) -> usize {
        self.data.len()
    }
}
