//! # Spectrum Buffer Module
//!
//! Derives a magnitude spectrum from every delivered frame and keeps the last
//! `buffer_rate` spectra per channel. The display reads the time average of
//! the ring, a cheap stand-in for a smoothed power spectral density.
//!
//! ## Transform
//! One forward FFT of length `frame_size` per channel per frame, rectangular
//! window, no overlap. Only the non-negative bins `0..=frame_size/2` are kept
//! and reported as unnormalised magnitudes `|X_k|`. Bin 0 (DC) is always
//! stored as zero.

use crate::error::AcquisitionError;
use crate::frame::Frame;
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

pub struct SpectrumRingBuffer {
    fft: Arc<dyn Fft<f64>>,
    frame_size: usize,
    /// [channel][slot][bin]
    slots: Vec<Vec<Vec<f64>>>,
    head: usize,
    frequencies: Vec<f64>,
    fft_buffer: Vec<Complex<f64>>,
    fft_scratch: Vec<Complex<f64>>,
}

impl SpectrumRingBuffer {
    pub fn new(channels: usize, frame_size: usize, sample_rate: f64, buffer_rate: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_size);
        let mut buffer = Self {
            fft,
            frame_size: 0,
            slots: Vec::new(),
            head: 0,
            frequencies: Vec::new(),
            fft_buffer: Vec::new(),
            fft_scratch: Vec::new(),
        };
        buffer.reset(channels, frame_size, sample_rate, buffer_rate);
        buffer
    }

    /// Replan the FFT and zero the ring for a new shape
    pub fn reset(&mut self, channels: usize, frame_size: usize, sample_rate: f64, buffer_rate: usize) {
        if frame_size != self.frame_size {
            let mut planner = FftPlanner::new();
            self.fft = planner.plan_fft_forward(frame_size);
        }
        let bins = frame_size / 2 + 1;
        self.frame_size = frame_size;
        self.slots = vec![vec![vec![0.0; bins]; buffer_rate]; channels];
        self.head = 0;
        self.frequencies = frequency_axis(frame_size, sample_rate);
        self.fft_buffer = vec![Complex::new(0.0, 0.0); frame_size];
        self.fft_scratch = vec![Complex::new(0.0, 0.0); self.fft.get_inplace_scratch_len()];
    }

    /// Transform `frame` and store its spectrum in place of the oldest one
    pub fn push(&mut self, frame: &Frame) -> Result<(), AcquisitionError> {
        if frame.channels() != self.slots.len() || frame.frame_size() != self.frame_size {
            return Err(AcquisitionError::FrameShape {
                expected: (self.slots.len(), self.frame_size),
                actual: (frame.channels(), frame.frame_size()),
            });
        }
        let buffer_rate = self.slots.first().map(|s| s.len()).unwrap_or(0);
        if buffer_rate == 0 || self.frame_size == 0 {
            return Ok(());
        }

        for (channel, ring) in self.slots.iter_mut().enumerate() {
            for (dst, &sample) in self.fft_buffer.iter_mut().zip(frame.channel(channel)) {
                *dst = Complex::new(sample, 0.0);
            }
            self.fft
                .process_with_scratch(&mut self.fft_buffer, &mut self.fft_scratch);

            let slot = &mut ring[self.head];
            for (magnitude, bin) in slot.iter_mut().zip(self.fft_buffer.iter()) {
                *magnitude = bin.norm();
            }
            slot[0] = 0.0;
        }
        self.head = (self.head + 1) % buffer_rate;
        Ok(())
    }

    /// Per-channel mean over every slot in the ring
    pub fn read(&self) -> Vec<Vec<f64>> {
        let bins = self.bins();
        self.slots
            .iter()
            .map(|ring| {
                let mut mean = vec![0.0; bins];
                for spectrum in ring {
                    for (acc, value) in mean.iter_mut().zip(spectrum) {
                        *acc += value;
                    }
                }
                if !ring.is_empty() {
                    let n = ring.len() as f64;
                    mean.iter_mut().for_each(|v| *v /= n);
                }
                mean
            })
            .collect()
    }

    /// Every stored spectrum, `[channel][slot][bin]`, in storage order
    #[cfg(test)]
    pub fn history(&self) -> &[Vec<Vec<f64>>] {
        &self.slots
    }

    pub fn frequency_axis(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn bins(&self) -> usize {
        self.frame_size / 2 + 1
    }

    /// Frequency of the strongest averaged bin per channel
    pub fn peak_frequencies(&self) -> Vec<Option<f64>> {
        self.read()
            .iter()
            .map(|mean| peak_frequency(mean, &self.frequencies))
            .collect()
    }
}

/// Bin centre frequencies for a real FFT of `frame_size` samples
pub fn frequency_axis(frame_size: usize, sample_rate: f64) -> Vec<f64> {
    if frame_size == 0 {
        return Vec::new();
    }
    (0..=frame_size / 2)
        .map(|k| k as f64 * sample_rate / frame_size as f64)
        .collect()
}

/// Frequency of the largest bin; `None` if the spectrum is empty or flat zero
pub fn peak_frequency(spectrum: &[f64], frequencies: &[f64]) -> Option<f64> {
    let (index, max) = spectrum
        .iter()
        .enumerate()
        .fold((0, 0.0), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
    if max > 0.0 {
        frequencies.get(index).copied()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sine_frame(freq: f64, sample_rate: f64, frame_size: usize, offset: f64) -> Frame {
        let samples = (0..frame_size)
            .map(|i| offset + (2.0 * PI * freq * i as f64 / sample_rate).sin())
            .collect();
        Frame::from_channels(vec![samples])
    }

    #[test]
    fn test_frequency_axis_matches_rfft() {
        let axis = frequency_axis(8, 800.0);
        assert_eq!(axis, vec![0.0, 100.0, 200.0, 300.0, 400.0]);
        assert_eq!(frequency_axis(7, 700.0).len(), 4);
    }

    #[test]
    fn test_dc_bin_always_zero() {
        let mut buffer = SpectrumRingBuffer::new(1, 64, 640.0, 3);
        for offset in [5.0, -3.0, 100.0, 0.25] {
            buffer.push(&sine_frame(50.0, 640.0, 64, offset)).unwrap();
            for ring in buffer.history() {
                for spectrum in ring {
                    assert_eq!(spectrum[0], 0.0);
                }
            }
        }
        assert_eq!(buffer.read()[0][0], 0.0);
    }

    #[test]
    fn test_peak_at_signal_frequency() {
        let sample_rate = 1024.0;
        let mut buffer = SpectrumRingBuffer::new(1, 256, sample_rate, 2);
        buffer.push(&sine_frame(64.0, sample_rate, 256, 0.0)).unwrap();
        assert_eq!(buffer.peak_frequencies(), vec![Some(64.0)]);

        // a unit sine peaks at N/2 = 128, averaged with the still-empty second slot
        let mean = buffer.read();
        let bin = 64 * 256 / 1024;
        assert!((mean[0][bin] - 64.0).abs() < 1e-6);
    }

    #[test]
    fn test_read_averages_whole_ring() {
        let mut buffer = SpectrumRingBuffer::new(1, 16, 16.0, 4);
        let frame = sine_frame(2.0, 16.0, 16, 0.0);
        buffer.push(&frame).unwrap();
        let one = buffer.read()[0][2];
        buffer.push(&frame).unwrap();
        let two = buffer.read()[0][2];
        assert!((two - 2.0 * one).abs() < 1e-9);

        for _ in 0..10 {
            buffer.push(&frame).unwrap();
        }
        // ring now holds four identical spectra
        assert!((buffer.read()[0][2] - 4.0 * one).abs() < 1e-9);
    }

    #[test]
    fn test_wrong_shape_rejected() {
        let mut buffer = SpectrumRingBuffer::new(2, 16, 16.0, 2);
        let before = buffer.read();
        assert!(buffer.push(&sine_frame(1.0, 16.0, 16, 0.0)).is_err());
        assert_eq!(buffer.read(), before);
    }

    #[test]
    fn test_reset_changes_bins() {
        let mut buffer = SpectrumRingBuffer::new(1, 16, 16.0, 2);
        buffer.reset(2, 32, 64.0, 3);
        assert_eq!(buffer.bins(), 17);
        assert_eq!(buffer.frequency_axis()[1], 2.0);
        assert_eq!(buffer.history().len(), 2);
        assert_eq!(buffer.history()[0].len(), 3);
    }

    #[test]
    fn test_peak_frequency_of_silence() {
        assert_eq!(peak_frequency(&[0.0, 0.0], &[0.0, 1.0]), None);
    }
}
