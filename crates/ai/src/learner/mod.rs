//! Online learner: one mutable model trained a sample at a time.
//!
//! ## Ordering
//!
//! [`OnlineLearner::learn`] predicts *before* it updates. The prior
//! prediction is what the error and the surprise flag are measured against;
//! updating first would make every sample look unsurprising.
//!
//! ## Backends
//!
//! The regression strategy is picked once, at construction, by
//! [`LearnerBackend::select`]. When the adaptive regressor is not compiled in
//! the learner falls back to a running-mean predictor behind the same
//! interface.
//!
//! ## Sharing
//!
//! Workers share one learner as a [`SharedLearner`]; the predict/update pair
//! runs under the mutex inside a single `learn` call.

pub mod checkpoint;
pub mod drift;
pub mod metrics;
pub mod regressor;
pub mod surprise;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use geoscan_core::FeatureMap;

use crate::error::AiError;

pub use checkpoint::{CHECKPOINT_VERSION, Checkpoint, CheckpointError};
pub use drift::{PageHinkley, PageHinkleyConfig};
pub use metrics::RollingMetrics;
#[cfg(feature = "adaptive")]
pub use regressor::AdaptiveRegressor;
pub use regressor::{Regressor, RegressorState, RunningMeanRegressor};
pub use surprise::SurpriseTracker;

/// Learner shared between worker threads.
pub type SharedLearner = Arc<Mutex<OnlineLearner>>;

/// Samples required before metrics are considered meaningful.
pub const READY_AFTER_SAMPLES: u64 = 10;

/// Regression strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearnerBackend {
    Adaptive,
    RunningMean,
}

impl LearnerBackend {
    /// Whether the adaptive regressor is compiled into this build.
    pub fn adaptive_available() -> bool {
        cfg!(feature = "adaptive")
    }

    /// Resolve a requested backend against what this build provides.
    pub fn select(preferred: LearnerBackend) -> LearnerBackend {
        match preferred {
            LearnerBackend::Adaptive if !Self::adaptive_available() => {
                warn!("adaptive regressor not compiled in, using running-mean predictor");
                LearnerBackend::RunningMean
            }
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LearnerBackend::Adaptive => "adaptive",
            LearnerBackend::RunningMean => "running_mean",
        }
    }
}

/// Learner knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub backend: LearnerBackend,
    /// EMA smoothing for the error baseline.
    pub ema_alpha: f64,
    /// `error > surprise_multiplier * ema` marks a surprise.
    pub surprise_multiplier: f64,
    /// Trailing window for MAE/R²/RMSE.
    pub metrics_window: usize,
    /// Checkpoint every N learned samples (0 disables periodic saves).
    pub checkpoint_every: u64,
    pub learning_rate: f64,
    pub bias_learning_rate: f64,
    /// Points kept in the in-memory learning curve.
    pub curve_capacity: usize,
    pub drift: PageHinkleyConfig,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            backend: LearnerBackend::Adaptive,
            ema_alpha: 0.1,
            surprise_multiplier: 2.0,
            metrics_window: 100,
            checkpoint_every: 50,
            learning_rate: 0.05,
            bias_learning_rate: 0.1,
            curve_capacity: 1000,
            drift: PageHinkleyConfig::default(),
        }
    }
}

impl LearnerConfig {
    pub fn with_backend(mut self, backend: LearnerBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_checkpoint_every(mut self, n: u64) -> Self {
        self.checkpoint_every = n;
        self
    }
}

/// Result of a single learning step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearnOutcome {
    /// Prediction made before the update.
    pub prediction: f64,
    /// `|label - prediction|`.
    pub error: f64,
    pub is_surprise: bool,
    pub drift_detected: bool,
}

/// Point-in-time view of learner health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningMetrics {
    pub backend: LearnerBackend,
    pub samples_learned: u64,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub r2: Option<f64>,
    pub error_ema: f64,
    pub surprise_count: u64,
    pub drift_events: u64,
    pub is_ready: bool,
}

/// One point of the in-memory learning curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub sample: u64,
    pub error: f64,
    pub error_ema: f64,
    pub mae: Option<f64>,
    pub drift: bool,
}

#[derive(Debug)]
pub struct OnlineLearner {
    config: LearnerConfig,
    regressor: Box<dyn Regressor>,
    surprise: SurpriseTracker,
    drift: PageHinkley,
    metrics: RollingMetrics,
    samples_learned: u64,
    surprise_count: u64,
    drift_events: u64,
    curve: VecDeque<CurvePoint>,
    checkpoint_path: Option<PathBuf>,
    last_checkpoint_at: u64,
}

fn build_regressor(backend: LearnerBackend, config: &LearnerConfig) -> Box<dyn Regressor> {
    match backend {
        #[cfg(feature = "adaptive")]
        LearnerBackend::Adaptive => Box::new(AdaptiveRegressor::new(
            config.learning_rate,
            config.bias_learning_rate,
        )),
        _ => {
            let _ = config;
            Box::new(RunningMeanRegressor::new())
        }
    }
}

fn restore_regressor(state: RegressorState) -> Option<Box<dyn Regressor>> {
    match state {
        #[cfg(feature = "adaptive")]
        RegressorState::Adaptive(s) => Some(Box::new(AdaptiveRegressor::from_state(s))),
        #[cfg(not(feature = "adaptive"))]
        RegressorState::Adaptive(_) => None,
        RegressorState::RunningMean(s) => Some(Box::new(RunningMeanRegressor::from_state(s))),
    }
}

impl OnlineLearner {
    /// Fresh model with no checkpoint attached.
    pub fn new(config: LearnerConfig) -> Self {
        let backend = LearnerBackend::select(config.backend);
        let regressor = build_regressor(backend, &config);
        Self {
            surprise: SurpriseTracker::new(config.ema_alpha, config.surprise_multiplier),
            drift: PageHinkley::new(config.drift.clone()),
            metrics: RollingMetrics::new(config.metrics_window),
            curve: VecDeque::with_capacity(config.curve_capacity.min(4096)),
            regressor,
            config,
            samples_learned: 0,
            surprise_count: 0,
            drift_events: 0,
            checkpoint_path: None,
            last_checkpoint_at: 0,
        }
    }

    /// Load from `path`, or start fresh when the checkpoint is missing,
    /// unreadable, from another version, or from another backend.
    ///
    /// Later saves go to the same path.
    pub fn open(config: LearnerConfig, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut learner = Self::new(config);

        match Checkpoint::load(&path) {
            Ok(Some(cp)) => {
                if cp.regressor.backend() != learner.backend() {
                    warn!(
                        path = %path.display(),
                        saved = cp.regressor.backend().as_str(),
                        active = learner.backend().as_str(),
                        "checkpoint backend differs, starting fresh"
                    );
                } else if let Some(regressor) = restore_regressor(cp.regressor) {
                    learner.regressor = regressor;
                    learner.surprise = cp.surprise;
                    learner.drift = cp.drift;
                    learner.metrics = cp.metrics;
                    learner.samples_learned = cp.samples_learned;
                    learner.surprise_count = cp.surprise_count;
                    learner.drift_events = cp.drift_events;
                    learner.last_checkpoint_at = cp.samples_learned;
                    info!(
                        path = %path.display(),
                        samples = cp.samples_learned,
                        "loaded learner checkpoint"
                    );
                }
            }
            Ok(None) => {
                info!(path = %path.display(), "no learner checkpoint, starting fresh");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unusable learner checkpoint, starting fresh");
            }
        }

        learner.checkpoint_path = Some(path);
        learner
    }

    pub fn into_shared(self) -> SharedLearner {
        Arc::new(Mutex::new(self))
    }

    pub fn backend(&self) -> LearnerBackend {
        self.regressor.backend()
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint_path.as_deref()
    }

    /// Never fails; 0.0 before any data has been seen.
    pub fn predict(&self, x: &FeatureMap) -> f64 {
        let y = self.regressor.predict(x);
        if y.is_finite() { y } else { 0.0 }
    }

    /// Predict, measure, then update.
    pub fn learn(&mut self, x: &FeatureMap, y: f64) -> Result<LearnOutcome, AiError> {
        if !y.is_finite() {
            return Err(AiError::InvalidInput(format!("label must be finite, got {y}")));
        }

        let prediction = self.predict(x);
        let error = (y - prediction).abs();
        let is_surprise = self.surprise.observe(error);

        self.regressor.update(x, y);
        self.metrics.push(y, prediction);
        self.samples_learned += 1;
        if is_surprise {
            self.surprise_count += 1;
        }

        let drift_detected = self.drift.update(error);
        if drift_detected {
            self.drift_events += 1;
            warn!(
                samples = self.samples_learned,
                drift_events = self.drift_events,
                error_ema = self.surprise.ema(),
                "concept drift detected"
            );
        }

        if self.config.curve_capacity > 0 {
            if self.curve.len() == self.config.curve_capacity {
                self.curve.pop_front();
            }
            self.curve.push_back(CurvePoint {
                sample: self.samples_learned,
                error,
                error_ema: self.surprise.ema(),
                mae: self.metrics.mae(),
                drift: drift_detected,
            });
        }

        Ok(LearnOutcome {
            prediction,
            error,
            is_surprise,
            drift_detected,
        })
    }

    pub fn samples_learned(&self) -> u64 {
        self.samples_learned
    }

    pub fn is_ready(&self) -> bool {
        self.samples_learned >= READY_AFTER_SAMPLES
    }

    pub fn metrics(&self) -> LearningMetrics {
        LearningMetrics {
            backend: self.backend(),
            samples_learned: self.samples_learned,
            mae: self.metrics.mae(),
            rmse: self.metrics.rmse(),
            r2: self.metrics.r2(),
            error_ema: self.surprise.ema(),
            surprise_count: self.surprise_count,
            drift_events: self.drift_events,
            is_ready: self.is_ready(),
        }
    }

    /// Most recent `last_n` curve points, oldest first.
    pub fn learning_curve(&self, last_n: usize) -> Vec<CurvePoint> {
        let skip = self.curve.len().saturating_sub(last_n);
        self.curve.iter().skip(skip).cloned().collect()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            samples_learned: self.samples_learned,
            surprise_count: self.surprise_count,
            drift_events: self.drift_events,
            regressor: self.regressor.snapshot(),
            surprise: self.surprise.clone(),
            drift: self.drift.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Save to the attached path. A learner without one is a no-op.
    pub fn save(&mut self) -> Result<(), AiError> {
        let Some(path) = self.checkpoint_path.clone() else {
            return Ok(());
        };
        self.checkpoint().save(&path)?;
        self.last_checkpoint_at = self.samples_learned;
        debug!(path = %path.display(), samples = self.samples_learned, "saved learner checkpoint");
        Ok(())
    }

    /// Save if `checkpoint_every` samples have passed since the last save.
    pub fn maybe_checkpoint(&mut self) -> Result<bool, AiError> {
        let every = self.config.checkpoint_every;
        if every == 0 || self.samples_learned - self.last_checkpoint_at < every {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }
}
