//! Scan targets: named regions with a point budget.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::geo::BoundingBox;
use crate::id::TargetId;

/// Lifecycle of a target, mirrored from its current job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Created,
    Queued,
    Scanning,
    Paused,
    Completed,
    Error,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Created => "created",
            TargetStatus::Queued => "queued",
            TargetStatus::Scanning => "scanning",
            TargetStatus::Paused => "paused",
            TargetStatus::Completed => "completed",
            TargetStatus::Error => "error",
        }
    }
}

/// Per-target scan knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    /// Candidate points generated per scan cycle.
    pub points_per_cycle: u32,
    /// Pause between cycles.
    #[serde(with = "duration_millis")]
    pub scan_interval: Duration,
    /// Point budget; the job completes once this many points are collected.
    pub max_total_points: u64,
    /// Utility score at or above which a point counts as high-value.
    pub high_value_threshold: f64,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            points_per_cycle: 50,
            scan_interval: Duration::from_secs(5),
            max_total_points: 10_000,
            high_value_threshold: 7.0,
        }
    }
}

impl TargetSettings {
    pub fn with_points_per_cycle(mut self, n: u32) -> Self {
        self.points_per_cycle = n;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_max_total_points(mut self, n: u64) -> Self {
        self.max_total_points = n;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.points_per_cycle == 0 {
            return Err(DomainError::validation("points_per_cycle must be > 0"));
        }
        if self.max_total_points == 0 {
            return Err(DomainError::validation("max_total_points must be > 0"));
        }
        Ok(())
    }
}

/// A geographic region to scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub description: String,
    pub bounds: BoundingBox,
    pub settings: TargetSettings,
    pub status: TargetStatus,
    pub points_collected: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Target {
    pub fn new(name: impl Into<String>, bounds: BoundingBox, settings: TargetSettings) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("target name must not be empty"));
        }
        bounds.validate()?;
        settings.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: TargetId::new(),
            name,
            description: String::new(),
            bounds,
            settings,
            status: TargetStatus::Created,
            points_collected: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Points still owed before the budget is exhausted.
    pub fn remaining_points(&self) -> u64 {
        self.settings.max_total_points.saturating_sub(self.points_collected)
    }

    pub fn is_budget_exhausted(&self) -> bool {
        self.remaining_points() == 0
    }

    /// Percentage of the budget collected, clamped to 0..=100.
    pub fn progress_percent(&self) -> f64 {
        let max = self.settings.max_total_points.max(1) as f64;
        (self.points_collected as f64 / max * 100.0).clamp(0.0, 100.0)
    }

    pub fn set_status(&mut self, status: TargetStatus) {
        self.status = status;
        if status != TargetStatus::Error {
            self.error_message = None;
        }
        self.updated_at = Utc::now();
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = TargetStatus::Error;
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub fn record_points(&mut self, n: u64) {
        self.points_collected = self.points_collected.saturating_add(n);
        self.updated_at = Utc::now();
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
