//! Regression strategies behind one interface.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use geoscan_core::FeatureMap;

use super::LearnerBackend;

/// An incrementally trained regressor.
///
/// `predict` must be total: it returns a finite number for any input,
/// including before the first `update`.
pub trait Regressor: Send + Sync + Debug {
    fn backend(&self) -> LearnerBackend;

    fn predict(&self, x: &FeatureMap) -> f64;

    fn update(&mut self, x: &FeatureMap, y: f64);

    fn snapshot(&self) -> RegressorState;
}

/// Serialisable regressor state for checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegressorState {
    Adaptive(AdaptiveState),
    RunningMean(RunningMeanState),
}

impl RegressorState {
    pub fn backend(&self) -> LearnerBackend {
        match self {
            RegressorState::Adaptive(_) => LearnerBackend::Adaptive,
            RegressorState::RunningMean(_) => LearnerBackend::RunningMean,
        }
    }
}

/// Welford accumulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStat {
    pub n: u64,
    pub mean: f64,
    pub m2: f64,
}

impl RunningStat {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn std_dev(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        (self.m2 / self.n as f64).max(0.0).sqrt()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMeanState {
    pub target: RunningStat,
}

/// Predicts the mean of every label seen so far.
///
/// Used when the adaptive backend is not compiled in or not selected.
#[derive(Debug, Clone, Default)]
pub struct RunningMeanRegressor {
    state: RunningMeanState,
}

impl RunningMeanRegressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: RunningMeanState) -> Self {
        Self { state }
    }
}

impl Regressor for RunningMeanRegressor {
    fn backend(&self) -> LearnerBackend {
        LearnerBackend::RunningMean
    }

    fn predict(&self, _x: &FeatureMap) -> f64 {
        if self.state.target.n == 0 {
            return 0.0;
        }
        self.state.target.mean
    }

    fn update(&mut self, _x: &FeatureMap, y: f64) {
        self.state.target.push(y);
    }

    fn snapshot(&self) -> RegressorState {
        RegressorState::RunningMean(self.state.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveState {
    pub learning_rate: f64,
    pub bias_learning_rate: f64,
    pub bias: f64,
    pub samples: u64,
    pub weights: BTreeMap<String, f64>,
    pub scalers: BTreeMap<String, RunningStat>,
}

/// Online linear model over running-standardised features.
///
/// Weights move by normalised LMS (`lr * err * z / (1 + |z|^2)`), the bias by
/// a plain LMS step. Feature keys are discovered as they appear; a key that
/// is absent from a sample contributes nothing to that prediction.
#[cfg(feature = "adaptive")]
#[derive(Debug, Clone)]
pub struct AdaptiveRegressor {
    state: AdaptiveState,
}

#[cfg(feature = "adaptive")]
impl AdaptiveRegressor {
    pub fn new(learning_rate: f64, bias_learning_rate: f64) -> Self {
        Self {
            state: AdaptiveState {
                learning_rate,
                bias_learning_rate,
                bias: 0.0,
                samples: 0,
                weights: BTreeMap::new(),
                scalers: BTreeMap::new(),
            },
        }
    }

    pub fn from_state(state: AdaptiveState) -> Self {
        Self { state }
    }

    fn standardised(&self, x: &FeatureMap) -> Vec<(String, f64)> {
        x.iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| {
                let z = match self.state.scalers.get(k) {
                    Some(stat) if stat.std_dev() > 1e-9 => (v - stat.mean) / stat.std_dev(),
                    _ => 0.0,
                };
                (k.clone(), z)
            })
            .collect()
    }

    fn raw_predict(&self, z: &[(String, f64)]) -> f64 {
        let dot: f64 = z
            .iter()
            .map(|(k, zk)| self.state.weights.get(k).copied().unwrap_or(0.0) * zk)
            .sum();
        self.state.bias + dot
    }
}

#[cfg(feature = "adaptive")]
impl Regressor for AdaptiveRegressor {
    fn backend(&self) -> LearnerBackend {
        LearnerBackend::Adaptive
    }

    fn predict(&self, x: &FeatureMap) -> f64 {
        if self.state.samples == 0 {
            return 0.0;
        }
        let y = self.raw_predict(&self.standardised(x));
        if y.is_finite() { y } else { 0.0 }
    }

    fn update(&mut self, x: &FeatureMap, y: f64) {
        for (k, v) in x.iter().filter(|(_, v)| v.is_finite()) {
            self.state.scalers.entry(k.clone()).or_default().push(*v);
        }
        self.state.samples += 1;

        let z = self.standardised(x);
        let err = y - self.raw_predict(&z);
        let norm = 1.0 + z.iter().map(|(_, zk)| zk * zk).sum::<f64>();
        let step = self.state.learning_rate * err / norm;

        for (k, zk) in &z {
            *self.state.weights.entry(k.clone()).or_insert(0.0) += step * zk;
        }
        self.state.bias += self.state.bias_learning_rate * err;
    }

    fn snapshot(&self) -> RegressorState {
        RegressorState::Adaptive(self.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(pairs: &[(&str, f64)]) -> FeatureMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn running_mean_predicts_mean() {
        let mut r = RunningMeanRegressor::new();
        assert_eq!(r.predict(&FeatureMap::new()), 0.0);
        for y in [2.0, 4.0, 6.0] {
            r.update(&FeatureMap::new(), y);
        }
        assert!((r.predict(&FeatureMap::new()) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn running_stat_matches_population_std() {
        let mut s = RunningStat::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            s.push(v);
        }
        assert!((s.mean - 5.0).abs() < 1e-12);
        assert!((s.std_dev() - 2.0).abs() < 1e-12);
    }

    #[cfg(feature = "adaptive")]
    #[test]
    fn adaptive_separates_two_classes() {
        let mut r = AdaptiveRegressor::new(0.05, 0.1);
        let hi = x(&[("has_road", 1.0)]);
        let lo = x(&[("has_road", 0.0)]);
        for _ in 0..500 {
            r.update(&hi, 8.0);
            r.update(&lo, 2.0);
        }
        assert!(r.predict(&hi) > 6.0, "hi = {}", r.predict(&hi));
        assert!(r.predict(&lo) < 4.0, "lo = {}", r.predict(&lo));
    }

    #[cfg(feature = "adaptive")]
    #[test]
    fn adaptive_snapshot_restores_predictions() {
        let mut r = AdaptiveRegressor::new(0.05, 0.1);
        let a = x(&[("slope_percent", 10.0)]);
        let b = x(&[("slope_percent", 30.0)]);
        for _ in 0..50 {
            r.update(&a, 7.0);
            r.update(&b, 3.0);
        }
        let RegressorState::Adaptive(state) = r.snapshot() else {
            panic!("wrong snapshot kind");
        };
        let restored = AdaptiveRegressor::from_state(state);
        assert_eq!(restored.predict(&a), r.predict(&a));
    }
}
