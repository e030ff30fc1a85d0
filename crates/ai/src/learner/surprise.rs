//! Error baseline used to call a sample "surprising".

use serde::{Deserialize, Serialize};

/// Exponential moving average of absolute prediction error.
///
/// The baseline starts at the first observed error, not zero. A sample is a
/// surprise when its error exceeds `multiplier` times the baseline as it
/// stood *before* that sample was folded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurpriseTracker {
    alpha: f64,
    multiplier: f64,
    ema: Option<f64>,
}

impl SurpriseTracker {
    pub fn new(alpha: f64, multiplier: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            multiplier,
            ema: None,
        }
    }

    /// Fold in one error and report whether it was a surprise.
    pub fn observe(&mut self, error: f64) -> bool {
        match self.ema {
            None => {
                self.ema = Some(error);
                false
            }
            Some(prev) => {
                let surprise = error > self.multiplier * prev;
                self.ema = Some(self.alpha * error + (1.0 - self.alpha) * prev);
                surprise
            }
        }
    }

    /// Current baseline; 0.0 before the first observation.
    pub fn ema(&self) -> f64 {
        self.ema.unwrap_or(0.0)
    }
}
