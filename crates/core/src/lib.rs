//! `geoscan-core`: domain building blocks for the scan pipeline.
//!
//! This crate contains **pure domain** types (no storage, threads or I/O):
//! geographic positions, site features, scan targets and the rule engine
//! that produces ground-truth utility scores.

pub mod error;
pub mod features;
pub mod geo;
pub mod id;
pub mod scoring;
pub mod target;

pub use error::{DomainError, DomainResult};
pub use features::{FeatureMap, FeatureSource, SiteFeatures, Zoning};
pub use geo::{BoundingBox, Position};
pub use id::{JobId, TargetId};
pub use scoring::{Rule, RuleEngine, RuleScore, RuleTable};
pub use target::{Target, TargetSettings, TargetStatus};
