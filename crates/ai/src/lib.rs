//! `geoscan-ai`
//!
//! **Responsibility:** the learning side of the scan pipeline.
//!
//! - [`learner`]: a single online regression model trained one sample at a
//!   time against rule-derived scores, with surprise tracking, drift
//!   detection and checkpointing.
//! - [`mismatch`]: stateless checks that flag disagreements between
//!   independent signals for a scanned position.
//!
//! Nothing here does storage or threading beyond a checkpoint file; the infra
//! crate wires these pieces into workers.

pub mod error;
pub mod learner;
pub mod mismatch;

pub use error::AiError;
pub use learner::{
    LearnOutcome, LearnerBackend, LearnerConfig, LearningMetrics, OnlineLearner, SharedLearner,
};
pub use mismatch::{
    Mismatch, MismatchDetector, MismatchError, MismatchKind, MismatchSummary, MismatchThresholds,
    Sample,
};
