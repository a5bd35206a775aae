//! Phi accrual failure detection over heartbeat inter-arrival times

use std::collections::VecDeque;

/// Suspicion level above which a peer is considered dead.
pub const DEFAULT_PHI_THRESHOLD: f64 = 8.0;

const MAX_SAMPLES: usize = 1000;
const INITIAL_INTERVAL_MS: f64 = 750.0;

#[derive(Debug, Clone, Default)]
pub struct AccrualFailureDetector {
    intervals: VecDeque<f64>,
    last_arrival: Option<u64>,
}

impl AccrualFailureDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat arrival at `now` (ms).
    pub fn add(&mut self, now: u64) {
        let interval = match self.last_arrival {
            Some(last) => now.saturating_sub(last) as f64,
            None => INITIAL_INTERVAL_MS,
        };
        self.last_arrival = Some(now);
        self.intervals.push_back(interval);
        if self.intervals.len() > MAX_SAMPLES {
            self.intervals.pop_front();
        }
    }

    pub fn last_arrival(&self) -> Option<u64> {
        self.last_arrival
    }

    pub fn samples(&self) -> usize {
        self.intervals.len()
    }

    fn mean(&self) -> f64 {
        if self.intervals.is_empty() {
            return INITIAL_INTERVAL_MS;
        }
        self.intervals.iter().sum::<f64>() / self.intervals.len() as f64
    }

    /// `-log10(e^(-dt/mean))`, which reduces to `dt / mean * log10(e)`.
    ///
    /// Zero until the first heartbeat has been seen.
    pub fn phi(&self, now: u64) -> f64 {
        let Some(last) = self.last_arrival else {
            return 0.0;
        };
        let delta = now.saturating_sub(last) as f64;
        let mean = self.mean();
        if mean <= 0.0 {
            // Every sample arrived in the same millisecond
            return if delta > 0.0 { f64::INFINITY } else { 0.0 };
        }
        delta / mean * std::f64::consts::LOG10_E
    }

    pub fn is_available(&self, now: u64, threshold: f64) -> bool {
        self.phi(now) <= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_samples_is_not_suspicious() {
        let detector = AccrualFailureDetector::new();
        assert_eq!(detector.phi(1_000_000), 0.0);
    }

    #[test]
    fn test_first_sample_is_seeded() {
        let mut detector = AccrualFailureDetector::new();
        detector.add(10_000);
        assert_eq!(detector.samples(), 1);
        // One mean interval of silence
        let phi = detector.phi(10_750);
        assert!((phi - std::f64::consts::LOG10_E).abs() < 1e-9);
    }

    #[test]
    fn test_regular_heartbeats_stay_below_threshold() {
        let mut detector = AccrualFailureDetector::new();
        let mut now = 0;
        for _ in 0..5000 {
            now += 200;
            detector.add(now);
            assert!(detector.phi(now + 200) < DEFAULT_PHI_THRESHOLD);
        }
        assert_eq!(detector.samples(), MAX_SAMPLES);
    }

    #[test]
    fn test_silence_crosses_threshold() {
        let mut detector = AccrualFailureDetector::new();
        let mut now = 0;
        for _ in 0..100 {
            now += 200;
            detector.add(now);
        }
        assert!(detector.is_available(now + 1_000, DEFAULT_PHI_THRESHOLD));
        // phi > 8 once dt exceeds roughly 18.4 mean intervals
        assert!(!detector.is_available(now + 5_000, DEFAULT_PHI_THRESHOLD));
    }
}
