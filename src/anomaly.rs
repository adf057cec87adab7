//! # Anomaly Detection Module
//!
//! Debounced alarm over the rolling wave buffer. Each evaluation compares the
//! buffer's mean absolute magnitude to a fixed threshold and moves a bounded
//! counter one step up or down. The flag is raised only while the counter
//! sits at its maximum, so five consecutive loud evaluations are needed to
//! raise it and a single quiet one lowers it again.

/// Mean absolute magnitude above which a wave buffer counts as abnormal
pub const DEFAULT_THRESHOLD: f64 = 0.005;

pub const ANOMALY_COUNTER_MAX: u8 = 5;

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    threshold: f64,
    counter: u8,
    flag: bool,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl AnomalyDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            counter: 0,
            flag: false,
        }
    }

    /// Update the counter from a wave snapshot and return the current flag
    pub fn evaluate(&mut self, wave_snapshot: &[Vec<f64>]) -> bool {
        let magnitude = mean_abs_magnitude(wave_snapshot);

        if magnitude > self.threshold {
            self.counter = (self.counter + 1).min(ANOMALY_COUNTER_MAX);
        } else {
            self.counter = self.counter.saturating_sub(1);
        }
        self.flag = self.counter == ANOMALY_COUNTER_MAX;

        log::trace!(
            "wave mean {:.6} (threshold {}), counter {}",
            magnitude,
            self.threshold,
            self.counter
        );
        self.flag
    }

    pub fn flag(&self) -> bool {
        self.flag
    }

    #[cfg(test)]
    pub fn counter(&self) -> u8 {
        self.counter
    }

    pub fn reset(&mut self) {
        self.counter = 0;
        self.flag = false;
    }
}

/// Mean of |x| over every sample of every channel
pub fn mean_abs_magnitude(wave_snapshot: &[Vec<f64>]) -> f64 {
    let (sum, count) = wave_snapshot
        .iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v.abs(), count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud() -> Vec<Vec<f64>> {
        vec![vec![0.5, -0.5, 0.5, -0.5]]
    }

    fn quiet() -> Vec<Vec<f64>> {
        vec![vec![0.0; 4]]
    }

    #[test]
    fn test_flag_needs_five_consecutive() {
        let mut detector = AnomalyDetector::default();
        for i in 1..5 {
            assert!(!detector.evaluate(&loud()));
            assert_eq!(detector.counter(), i);
        }
        assert!(detector.evaluate(&loud()));
        assert_eq!(detector.counter(), ANOMALY_COUNTER_MAX);
    }

    #[test]
    fn test_full_hysteresis_sequence() {
        let mut detector = AnomalyDetector::default();
        for _ in 0..5 {
            detector.evaluate(&loud());
        }
        assert!(detector.flag());

        // one quiet evaluation drops the counter below max and clears the flag
        assert!(!detector.evaluate(&quiet()));
        assert_eq!(detector.counter(), 4);

        // four more loud ones would reach 8; the counter clamps at 5
        let flags: Vec<bool> = (0..4).map(|_| detector.evaluate(&loud())).collect();
        assert_eq!(flags, vec![true, true, true, true]);
        assert_eq!(detector.counter(), ANOMALY_COUNTER_MAX);

        for expected in (0..5).rev() {
            assert!(!detector.evaluate(&quiet()));
            assert_eq!(detector.counter(), expected);
        }
        // clamped at zero
        detector.evaluate(&quiet());
        assert_eq!(detector.counter(), 0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut detector = AnomalyDetector::new(0.5);
        detector.evaluate(&vec![vec![0.5, -0.5]]);
        assert_eq!(detector.counter(), 0);
    }

    #[test]
    fn test_empty_snapshot_counts_as_quiet() {
        let mut detector = AnomalyDetector::default();
        detector.evaluate(&loud());
        detector.evaluate(&[]);
        assert_eq!(detector.counter(), 0);
        assert_eq!(mean_abs_magnitude(&[]), 0.0);
    }

    #[test]
    fn test_reset() {
        let mut detector = AnomalyDetector::default();
        for _ in 0..5 {
            detector.evaluate(&loud());
        }
        detector.reset();
        assert!(!detector.flag());
        assert_eq!(detector.counter(), 0);
    }
}
