//! Trailing-window regression metrics.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// MAE, RMSE and R² over the last `window` (label, prediction) pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingMetrics {
    window: usize,
    pairs: VecDeque<(f64, f64)>,
}

impl RollingMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            pairs: VecDeque::with_capacity(window.max(1)),
        }
    }

    pub fn push(&mut self, y: f64, y_hat: f64) {
        if self.pairs.len() == self.window {
            self.pairs.pop_front();
        }
        self.pairs.push_back((y, y_hat));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn mae(&self) -> Option<f64> {
        if self.pairs.is_empty() {
            return None;
        }
        let sum: f64 = self.pairs.iter().map(|(y, p)| (y - p).abs()).sum();
        Some(sum / self.pairs.len() as f64)
    }

    pub fn rmse(&self) -> Option<f64> {
        if self.pairs.is_empty() {
            return None;
        }
        let sum: f64 = self.pairs.iter().map(|(y, p)| (y - p).powi(2)).sum();
        Some((sum / self.pairs.len() as f64).sqrt())
    }

    /// Coefficient of determination. A constant label stream scores 1.0 when
    /// predicted exactly and 0.0 otherwise.
    pub fn r2(&self) -> Option<f64> {
        if self.pairs.is_empty() {
            return None;
        }
        let n = self.pairs.len() as f64;
        let mean = self.pairs.iter().map(|(y, _)| y).sum::<f64>() / n;
        let ss_tot: f64 = self.pairs.iter().map(|(y, _)| (y - mean).powi(2)).sum();
        let ss_res: f64 = self.pairs.iter().map(|(y, p)| (y - p).powi(2)).sum();
        if ss_tot <= f64::EPSILON {
            return Some(if ss_res <= f64::EPSILON { 1.0 } else { 0.0 });
        }
        Some(1.0 - ss_res / ss_tot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_evicts_oldest() {
        let mut m = RollingMetrics::new(2);
        m.push(10.0, 0.0);
        m.push(1.0, 2.0);
        m.push(3.0, 2.0);
        assert_eq!(m.len(), 2);
        assert_eq!(m.mae(), Some(1.0));
    }

    #[test]
    fn perfect_predictions() {
        let mut m = RollingMetrics::new(10);
        for y in [1.0, 2.0, 3.0] {
            m.push(y, y);
        }
        assert_eq!(m.r2(), Some(1.0));
        assert_eq!(m.rmse(), Some(0.0));
    }

    #[test]
    fn empty_window_has_no_metrics() {
        let m = RollingMetrics::new(5);
        assert!(m.mae().is_none());
        assert!(m.r2().is_none());
    }
}
