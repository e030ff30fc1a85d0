use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use geoscan_ai::{MismatchKind, MismatchSummary};
use geoscan_core::{Position, TargetId};

/// One scored sample, as produced by a scan cycle.
///
/// Immutable once written. `features` and `trace` are opaque blobs for
/// display; the archive log is what offline retraining reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub timestamp: DateTime<Utc>,
    pub target_id: Option<TargetId>,
    pub position: Position,
    /// Rule-derived ground truth.
    pub utility_score: f64,
    /// Model prediction made before learning from this sample.
    pub predicted_score: f64,
    pub absolute_error: f64,
    pub is_surprise: bool,
    pub mismatches: MismatchSummary,
    pub features: JsonValue,
    pub trace: Vec<String>,
}

impl ScanEvent {
    pub fn is_high_value(&self, threshold: f64) -> bool {
        self.utility_score >= threshold
    }
}

/// An event with the id the store assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    #[serde(flatten)]
    pub event: ScanEvent,
}

/// High-value events seen in a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowRate {
    pub window_secs: u64,
    pub count: u64,
    pub per_minute: f64,
}

impl WindowRate {
    pub fn new(window: Duration, count: u64) -> Self {
        let minutes = window.as_secs_f64() / 60.0;
        Self {
            window_secs: window.as_secs(),
            count,
            per_minute: if minutes > 0.0 { count as f64 / minutes } else { 0.0 },
        }
    }
}

/// Mismatch counts by kind over the most recent `sampled` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchHistogram {
    pub slope: u64,
    pub zoning: u64,
    pub utility: u64,
    pub flood: u64,
    pub surprise: u64,
    pub sampled: u64,
}

impl MismatchHistogram {
    pub fn count(&self, kind: MismatchKind) -> u64 {
        match kind {
            MismatchKind::Slope => self.slope,
            MismatchKind::Zoning => self.zoning,
            MismatchKind::Utility => self.utility,
            MismatchKind::Flood => self.flood,
        }
    }

    pub(crate) fn record(&mut self, event: &ScanEvent) {
        self.sampled += 1;
        for kind in &event.mismatches.kinds {
            match kind {
                MismatchKind::Slope => self.slope += 1,
                MismatchKind::Zoning => self.zoning += 1,
                MismatchKind::Utility => self.utility += 1,
                MismatchKind::Flood => self.flood += 1,
            }
        }
        if event.is_surprise {
            self.surprise += 1;
        }
    }
}

/// One minute of aggregated activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveBucket {
    /// Minutes since the Unix epoch.
    pub minute: i64,
    pub event_count: u64,
    pub avg_error: f64,
    pub high_value_count: u64,
    pub surprise_count: u64,
    pub avg_utility: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventStats {
    pub total: u64,
    pub avg_utility: Option<f64>,
    pub avg_error: Option<f64>,
    pub high_value: u64,
    pub surprises: u64,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

/// Retention and caching limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStoreConfig {
    /// Events kept after a prune.
    pub max_events: u64,
    /// Overshoot tolerated before an amortised prune deletes anything.
    pub prune_slack: u64,
    /// Minimum gap between amortised prunes.
    pub prune_interval_secs: u64,
    /// Newest events kept in memory for `recent`.
    pub recent_cache: usize,
    pub high_value_threshold: f64,
    /// Lifetime of cached aggregates; 0 disables caching.
    pub aggregate_ttl_ms: u64,
    /// Events considered by `mismatch_histogram`.
    pub histogram_window: u64,
    pub bucket_retention_minutes: i64,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_events: 1000,
            prune_slack: 100,
            prune_interval_secs: 10,
            recent_cache: 100,
            high_value_threshold: 5.0,
            aggregate_ttl_ms: 5000,
            histogram_window: 100,
            bucket_retention_minutes: 60,
        }
    }
}

impl EventStoreConfig {
    pub fn with_max_events(mut self, max_events: u64, prune_slack: u64) -> Self {
        self.max_events = max_events;
        self.prune_slack = prune_slack;
        self
    }

    pub fn with_prune_interval(mut self, secs: u64) -> Self {
        self.prune_interval_secs = secs;
        self
    }

    pub fn with_aggregate_ttl(mut self, ttl: Duration) -> Self {
        self.aggregate_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn aggregate_ttl(&self) -> Duration {
        Duration::from_millis(self.aggregate_ttl_ms)
    }

    /// Size of the in-memory recent cache; never larger than what survives a prune.
    pub fn recent_capacity(&self) -> usize {
        self.recent_cache.min(usize::try_from(self.max_events).unwrap_or(usize::MAX))
    }
}

/// Event store operation error.
///
/// `insert` never returns one (it logs and reports `false`); reads surface
/// storage and decode failures to the caller.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("event storage error: {0}")]
    Storage(String),

    #[error("failed to decode stored event {id}: {reason}")]
    Decode { id: i64, reason: String },

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

/// Bounded sink for scored samples.
///
/// Implementations must be safe for concurrent writers and readers, and a
/// read issued after `insert` returned `true` must observe the event.
pub trait EventStore: Send + Sync {
    /// Store one event. Storage failures are logged and reported as `false`.
    fn insert(&self, event: &ScanEvent) -> bool;

    /// Newest first.
    fn recent(&self, n: usize) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn high_value_rate(&self, window: Duration) -> Result<WindowRate, EventStoreError>;

    fn mismatch_histogram(&self) -> Result<MismatchHistogram, EventStoreError>;

    /// Trim to `max_events` now, regardless of the amortisation interval.
    /// Returns the number of deleted events.
    fn prune(&self) -> Result<u64, EventStoreError>;

    fn count(&self) -> Result<u64, EventStoreError>;

    /// Per-minute buckets for the trailing `minutes`, oldest first.
    fn learning_curve(&self, minutes: u32) -> Result<Vec<CurveBucket>, EventStoreError>;

    fn stats(&self) -> Result<EventStats, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn insert(&self, event: &ScanEvent) -> bool {
        (**self).insert(event)
    }

    fn recent(&self, n: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).recent(n)
    }

    fn high_value_rate(&self, window: Duration) -> Result<WindowRate, EventStoreError> {
        (**self).high_value_rate(window)
    }

    fn mismatch_histogram(&self) -> Result<MismatchHistogram, EventStoreError> {
        (**self).mismatch_histogram()
    }

    fn prune(&self) -> Result<u64, EventStoreError> {
        (**self).prune()
    }

    fn count(&self) -> Result<u64, EventStoreError> {
        (**self).count()
    }

    fn learning_curve(&self, minutes: u32) -> Result<Vec<CurveBucket>, EventStoreError> {
        (**self).learning_curve(minutes)
    }

    fn stats(&self) -> Result<EventStats, EventStoreError> {
        (**self).stats()
    }
}
