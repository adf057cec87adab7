//! # Visualization Helpers Module
//!
//! Turns engine snapshots into what a chart actually draws: decimated
//! waveforms, spectra normalised to 0~1, the frequency axis limit that
//! matches the decimated spectrum, and a marker at the dominant frequency
//! while the anomaly flag is raised. Nothing here renders.
//!
//! ## Decimation
//! Plain stride sampling (`samples[::step]`), no filtering. The display is a
//! preview; recordings always keep every sample.

use crate::spectrum::peak_frequency;

/// Every `step`-th sample starting at the first
pub fn downsample(samples: &[f64], step: usize) -> Vec<f64> {
    samples.iter().step_by(step.max(1)).copied().collect()
}

/// Scale to a maximum of 1. An all-zero spectrum stays zero.
pub fn normalize(spectrum: &[f64]) -> Vec<f64> {
    let max = spectrum.iter().copied().fold(0.0, f64::max);
    if max > 0.0 {
        spectrum.iter().map(|v| v / max).collect()
    } else {
        vec![0.0; spectrum.len()]
    }
}

/// Highest frequency the decimated spectrum axis should show
pub fn display_frequency_limit(frequencies: &[f64], step: usize) -> Option<f64> {
    let tail = frequencies.len() % step.max(1);
    frequencies
        .len()
        .checked_sub(tail + 1)
        .and_then(|i| frequencies.get(i))
        .copied()
}

/// Chart-ready data for one refresh
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    pub waves: Vec<Vec<f64>>,
    pub spectra: Vec<Vec<f64>>,
    pub frequency_limit: Option<f64>,
    /// Dominant frequency per channel, only while the anomaly flag is set
    pub markers: Vec<Option<f64>>,
}

impl DisplayFrame {
    pub fn build(
        wave: &[Vec<f64>],
        spectrum: &[Vec<f64>],
        frequencies: &[f64],
        wave_step: usize,
        spectrum_step: usize,
        anomaly: bool,
    ) -> Self {
        Self {
            waves: wave.iter().map(|w| downsample(w, wave_step)).collect(),
            spectra: spectrum
                .iter()
                .map(|s| normalize(&downsample(s, spectrum_step)))
                .collect(),
            frequency_limit: display_frequency_limit(frequencies, spectrum_step),
            markers: spectrum
                .iter()
                .map(|s| if anomaly { peak_frequency(s, frequencies) } else { None })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_keeps_first_sample() {
        let samples: Vec<f64> = (0..10).map(|v| v as f64).collect();
        assert_eq!(downsample(&samples, 4), vec![0.0, 4.0, 8.0]);
        assert_eq!(downsample(&samples, 0).len(), 10);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(&[0.0, 2.0, 4.0]), vec![0.0, 0.5, 1.0]);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_frequency_limit_follows_step() {
        let freqs = [0.0, 10.0, 20.0, 30.0, 40.0];
        assert_eq!(display_frequency_limit(&freqs, 1), Some(40.0));
        // 5 % 2 = 1 → second to last
        assert_eq!(display_frequency_limit(&freqs, 2), Some(30.0));
        assert_eq!(display_frequency_limit(&freqs, 3), Some(20.0));
        assert_eq!(display_frequency_limit(&[], 2), None);
    }

    #[test]
    fn test_marker_only_when_anomalous() {
        let spectrum = vec![vec![0.0, 1.0, 3.0, 2.0]];
        let freqs = [0.0, 5.0, 10.0, 15.0];
        let wave = vec![vec![0.0; 8]];

        let quiet = DisplayFrame::build(&wave, &spectrum, &freqs, 2, 1, false);
        assert_eq!(quiet.markers, vec![None]);
        assert_eq!(quiet.waves[0].len(), 4);

        let loud = DisplayFrame::build(&wave, &spectrum, &freqs, 2, 1, true);
        assert_eq!(loud.markers, vec![Some(10.0)]);
        assert_eq!(loud.spectra[0][2], 1.0);
    }
}
