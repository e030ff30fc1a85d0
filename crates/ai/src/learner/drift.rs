//! Page-Hinkley change detector over the error stream.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageHinkleyConfig {
    /// Samples required before a change can be signalled.
    pub min_instances: u64,
    /// Tolerated magnitude of change.
    pub delta: f64,
    /// Detection threshold (lambda).
    pub threshold: f64,
    /// Forgetting factor applied to the cumulative sum.
    pub alpha: f64,
}

impl Default for PageHinkleyConfig {
    fn default() -> Self {
        Self {
            min_instances: 30,
            delta: 0.005,
            threshold: 50.0,
            alpha: 0.9999,
        }
    }
}

/// Detects an upward shift in the mean of a stream.
///
/// Resets itself after signalling so the next change is measured from the
/// new regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageHinkley {
    config: PageHinkleyConfig,
    n: u64,
    mean: f64,
    sum: f64,
    min_sum: f64,
}

impl PageHinkley {
    pub fn new(config: PageHinkleyConfig) -> Self {
        Self {
            config,
            n: 0,
            mean: 0.0,
            sum: 0.0,
            min_sum: 0.0,
        }
    }

    /// Feed one value; returns `true` when a change is detected.
    pub fn update(&mut self, x: f64) -> bool {
        if !x.is_finite() {
            return false;
        }
        self.n += 1;
        self.mean += (x - self.mean) / self.n as f64;
        self.sum = self.config.alpha * self.sum + (x - self.mean - self.config.delta);
        self.min_sum = self.min_sum.min(self.sum);

        if self.n >= self.config.min_instances && self.sum - self.min_sum > self.config.threshold {
            self.reset();
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.n = 0;
        self.mean = 0.0;
        self.sum = 0.0;
        self.min_sum = 0.0;
    }

    pub fn samples(&self) -> u64 {
        self.n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_stream_never_drifts() {
        let mut ph = PageHinkley::new(PageHinkleyConfig::default());
        assert!((0..2000).all(|i| !ph.update(1.0 + 0.01 * ((i % 7) as f64))));
    }

    #[test]
    fn level_shift_is_detected_and_resets() {
        let mut ph = PageHinkley::new(PageHinkleyConfig::default());
        for _ in 0..200 {
            assert!(!ph.update(0.5));
        }
        let detected_at = (0..200).position(|_| ph.update(5.0));
        assert!(detected_at.is_some());
        assert!(ph.samples() < 200);
    }

    #[test]
    fn respects_min_instances() {
        let mut ph = PageHinkley::new(PageHinkleyConfig {
            threshold: 0.1,
            ..Default::default()
        });
        // Large jump inside the warm-up window is ignored.
        assert!(!ph.update(0.0));
        assert!((0..20).all(|_| !ph.update(100.0)));
    }
}
