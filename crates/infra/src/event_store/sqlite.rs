//! SQLite-backed ring buffer of scan events.
//!
//! Every insert writes the event row and upserts its one-minute aggregate
//! bucket in one transaction. Bookkeeping (recent cache, prune clock,
//! aggregate caches) lives behind a single mutex that is held for the
//! duration of an insert, so one store's writes land in submission order.
//!
//! Aggregate caches carry a generation number bumped by every insert: a
//! value computed before an insert is never served after it.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, error, info, warn};

use geoscan_ai::{MismatchKind, MismatchSummary};
use geoscan_core::Position;

use crate::db::{Database, EVENTS_SCHEMA, describe_sqlx_error, from_millis, to_millis};

use super::r#trait::{
    CurveBucket, EventStats, EventStore, EventStoreConfig, EventStoreError, MismatchHistogram,
    ScanEvent, StoredEvent, WindowRate,
};

const EVENT_COLUMNS: &str = "id, timestamp, target_id, lat, lon, utility_score, predicted_score, \
     absolute_error, is_surprise, mismatch_count, mismatch_kinds, max_severity, features, trace";

struct Cached<T> {
    at: Instant,
    generation: u64,
    value: T,
}

struct Bookkeeping {
    /// Newest first.
    recent: VecDeque<StoredEvent>,
    last_prune: Instant,
    generation: u64,
    rates: HashMap<u128, Cached<WindowRate>>,
    histogram: Option<Cached<MismatchHistogram>>,
}

impl Bookkeeping {
    fn fresh<T: Copy>(&self, cached: Option<&Cached<T>>, ttl: Duration) -> Option<T> {
        cached
            .filter(|c| c.generation == self.generation && c.at.elapsed() < ttl)
            .map(|c| c.value)
    }
}

pub struct SqliteEventStore {
    db: Database,
    config: EventStoreConfig,
    state: Mutex<Bookkeeping>,
}

impl std::fmt::Debug for SqliteEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEventStore")
            .field("path", &self.db.path())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    EventStoreError::Storage(describe_sqlx_error(operation, err))
}

impl SqliteEventStore {
    /// Open (or create) the events database at `path`.
    pub fn open(path: impl AsRef<Path>, config: EventStoreConfig) -> Result<Self, EventStoreError> {
        let db = Database::open(path, &EVENTS_SCHEMA)?;
        Self::new(db, config)
    }

    /// Wrap a database prepared with the events schema and warm the recent cache.
    pub fn new(db: Database, config: EventStoreConfig) -> Result<Self, EventStoreError> {
        let warm = db.block_on(Self::query_recent(&db, config.recent_capacity()))?;
        debug!(db = %db.path().display(), cached = warm.len(), "event store opened");
        Ok(Self {
            db,
            state: Mutex::new(Bookkeeping {
                recent: warm.into(),
                last_prune: Instant::now(),
                generation: 0,
                rates: HashMap::new(),
                histogram: None,
            }),
            config,
        })
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Bookkeeping> {
        // Bookkeeping holds caches only; a panic mid-update cannot corrupt stored rows.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn query_recent(db: &Database, n: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1"
        ))
        .bind(i64::try_from(n).unwrap_or(i64::MAX))
        .fetch_all(db.pool())
        .await
        .map_err(|e| map_sqlx_error("recent", e))?;
        rows.iter().map(event_from_row).collect()
    }

    async fn write(&self, event: &ScanEvent) -> Result<i64, EventStoreError> {
        let encode = |what: &str, e: serde_json::Error| {
            EventStoreError::Storage(format!("failed to encode event {what}: {e}"))
        };
        let kinds = serde_json::to_string(&event.mismatches.kinds).map_err(|e| encode("mismatch kinds", e))?;
        let features = serde_json::to_string(&event.features).map_err(|e| encode("features", e))?;
        let trace = serde_json::to_string(&event.trace).map_err(|e| encode("trace", e))?;
        let high_value = event.is_high_value(self.config.high_value_threshold);
        let flag = |kind| i64::from(event.mismatches.contains(kind));

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO events (
                timestamp, target_id, lat, lon, utility_score, predicted_score, absolute_error,
                is_surprise, is_high_value, mismatch_count, mismatch_kinds, max_severity,
                slope_mismatch, zoning_mismatch, utility_mismatch, flood_mismatch, features, trace
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            RETURNING id
            "#,
        )
        .bind(to_millis(event.timestamp))
        .bind(event.target_id.map(|t| t.to_string()))
        .bind(event.position.lat)
        .bind(event.position.lon)
        .bind(event.utility_score)
        .bind(event.predicted_score)
        .bind(event.absolute_error)
        .bind(i64::from(event.is_surprise))
        .bind(i64::from(high_value))
        .bind(i64::try_from(event.mismatches.count).unwrap_or(i64::MAX))
        .bind(kinds)
        .bind(event.mismatches.max_severity)
        .bind(flag(MismatchKind::Slope))
        .bind(flag(MismatchKind::Zoning))
        .bind(flag(MismatchKind::Utility))
        .bind(flag(MismatchKind::Flood))
        .bind(features)
        .bind(trace)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        sqlx::query(
            r#"
            INSERT INTO event_buckets (minute, event_count, high_value_count, surprise_count, total_error, total_utility)
            VALUES (?1, 1, ?2, ?3, ?4, ?5)
            ON CONFLICT(minute) DO UPDATE SET
                event_count      = event_count + 1,
                high_value_count = high_value_count + excluded.high_value_count,
                surprise_count   = surprise_count + excluded.surprise_count,
                total_error      = total_error + excluded.total_error,
                total_utility    = total_utility + excluded.total_utility
            "#,
        )
        .bind(event.timestamp.timestamp().div_euclid(60))
        .bind(i64::from(high_value))
        .bind(i64::from(event.is_surprise))
        .bind(event.absolute_error)
        .bind(event.utility_score)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("insert", e))?;
        Ok(id)
    }

    /// Delete the oldest events once more than `threshold` are stored, leaving
    /// `max_events`, and expire buckets past the retention window.
    fn trim(&self, threshold: u64) -> Result<u64, EventStoreError> {
        let max_events = i64::try_from(self.config.max_events).unwrap_or(i64::MAX);
        let threshold = i64::try_from(threshold).unwrap_or(i64::MAX);
        let cutoff_minute =
            Utc::now().timestamp().div_euclid(60) - self.config.bucket_retention_minutes.max(0);

        self.db.block_on(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("prune", e))?;

            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("prune", e))?;

            let mut deleted = 0;
            if count > threshold {
                deleted = sqlx::query(
                    r#"
                    DELETE FROM events WHERE id IN (
                        SELECT id FROM events ORDER BY timestamp ASC, id ASC LIMIT ?1
                    )
                    "#,
                )
                .bind(count - max_events)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("prune", e))?
                .rows_affected();
            }

            sqlx::query("DELETE FROM event_buckets WHERE minute < ?1")
                .bind(cutoff_minute)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("prune", e))?;

            tx.commit().await.map_err(|e| map_sqlx_error("prune", e))?;
            Ok(deleted)
        })
    }

    fn maybe_prune(&self, state: &mut Bookkeeping) {
        if state.last_prune.elapsed() < self.config.prune_interval() {
            return;
        }
        state.last_prune = Instant::now();

        match self.trim(self.config.max_events.saturating_add(self.config.prune_slack)) {
            Ok(0) => {}
            Ok(deleted) => {
                state.generation += 1;
                info!(deleted, max_events = self.config.max_events, "pruned old events");
            }
            Err(e) => warn!(error = %e, "event prune failed"),
        }
    }
}

fn event_from_row(row: &SqliteRow) -> Result<StoredEvent, EventStoreError> {
    let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("decode", e))?;
    let bad = |reason: String| EventStoreError::Decode { id, reason };
    let get_err = |e: sqlx::Error| bad(e.to_string());

    let timestamp: i64 = row.try_get("timestamp").map_err(get_err)?;
    let target_id: Option<String> = row.try_get("target_id").map_err(get_err)?;
    let kinds: String = row.try_get("mismatch_kinds").map_err(get_err)?;
    let features: String = row.try_get("features").map_err(get_err)?;
    let trace: String = row.try_get("trace").map_err(get_err)?;
    let is_surprise: i64 = row.try_get("is_surprise").map_err(get_err)?;
    let mismatch_count: i64 = row.try_get("mismatch_count").map_err(get_err)?;

    let event = ScanEvent {
        timestamp: from_millis(timestamp).ok_or_else(|| bad(format!("timestamp {timestamp} out of range")))?,
        target_id: target_id
            .map(|t| t.parse().map_err(|_| bad(format!("invalid target id {t}"))))
            .transpose()?,
        position: Position::new(
            row.try_get("lat").map_err(get_err)?,
            row.try_get("lon").map_err(get_err)?,
        ),
        utility_score: row.try_get("utility_score").map_err(get_err)?,
        predicted_score: row.try_get("predicted_score").map_err(get_err)?,
        absolute_error: row.try_get("absolute_error").map_err(get_err)?,
        is_surprise: is_surprise != 0,
        mismatches: MismatchSummary {
            kinds: serde_json::from_str(&kinds).map_err(|e| bad(format!("mismatch kinds: {e}")))?,
            count: usize::try_from(mismatch_count).unwrap_or(0),
            max_severity: row.try_get("max_severity").map_err(get_err)?,
        },
        features: serde_json::from_str(&features).map_err(|e| bad(format!("features: {e}")))?,
        trace: serde_json::from_str(&trace).map_err(|e| bad(format!("trace: {e}")))?,
    };
    Ok(StoredEvent { id, event })
}

fn as_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

impl EventStore for SqliteEventStore {
    fn insert(&self, event: &ScanEvent) -> bool {
        let mut state = self.lock();
        match self.db.block_on(self.write(event)) {
            Ok(id) => {
                state.recent.push_front(StoredEvent {
                    id,
                    event: event.clone(),
                });
                state.recent.truncate(self.config.recent_capacity());
                state.generation += 1;
                self.maybe_prune(&mut state);
                debug!(
                    event_id = id,
                    lat = event.position.lat,
                    lon = event.position.lon,
                    score = event.utility_score,
                    "inserted event"
                );
                true
            }
            Err(e) => {
                error!(error = %e, "failed to insert event");
                false
            }
        }
    }

    fn recent(&self, n: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        {
            let state = self.lock();
            if n <= state.recent.len() {
                return Ok(state.recent.iter().take(n).cloned().collect());
            }
        }
        self.db.block_on(Self::query_recent(&self.db, n))
    }

    fn high_value_rate(&self, window: Duration) -> Result<WindowRate, EventStoreError> {
        let key = window.as_millis();
        let ttl = self.config.aggregate_ttl();
        let generation = {
            let state = self.lock();
            if let Some(rate) = state.fresh(state.rates.get(&key), ttl) {
                return Ok(rate);
            }
            state.generation
        };

        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w))
            .map(to_millis)
            .unwrap_or(i64::MIN);

        let count: i64 = self
            .db
            .block_on(
                sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE timestamp > ?1 AND is_high_value = 1")
                    .bind(cutoff)
                    .fetch_one(self.db.pool()),
            )
            .map_err(|e| map_sqlx_error("high_value_rate", e))?;
        let rate = WindowRate::new(window, as_count(count));

        let mut state = self.lock();
        if !ttl.is_zero() && state.generation == generation {
            state.rates.insert(
                key,
                Cached {
                    at: Instant::now(),
                    generation,
                    value: rate,
                },
            );
        }
        Ok(rate)
    }

    fn mismatch_histogram(&self) -> Result<MismatchHistogram, EventStoreError> {
        let ttl = self.config.aggregate_ttl();
        let generation = {
            let state = self.lock();
            if let Some(histogram) = state.fresh(state.histogram.as_ref(), ttl) {
                return Ok(histogram);
            }
            state.generation
        };

        let row = self
            .db
            .block_on(
                sqlx::query(
                    r#"
                    SELECT COUNT(*)                          AS sampled,
                           COALESCE(SUM(slope_mismatch), 0)   AS slope,
                           COALESCE(SUM(zoning_mismatch), 0)  AS zoning,
                           COALESCE(SUM(utility_mismatch), 0) AS utility,
                           COALESCE(SUM(flood_mismatch), 0)   AS flood,
                           COALESCE(SUM(is_surprise), 0)      AS surprise
                    FROM (
                        SELECT slope_mismatch, zoning_mismatch, utility_mismatch, flood_mismatch, is_surprise
                        FROM events
                        ORDER BY timestamp DESC, id DESC
                        LIMIT ?1
                    )
                    "#,
                )
                .bind(i64::try_from(self.config.histogram_window).unwrap_or(i64::MAX))
                .fetch_one(self.db.pool()),
            )
            .map_err(|e| map_sqlx_error("mismatch_histogram", e))?;

        let get = |col: &str| -> Result<u64, EventStoreError> {
            row.try_get::<i64, _>(col)
                .map(as_count)
                .map_err(|e| map_sqlx_error("mismatch_histogram", e))
        };
        let histogram = MismatchHistogram {
            slope: get("slope")?,
            zoning: get("zoning")?,
            utility: get("utility")?,
            flood: get("flood")?,
            surprise: get("surprise")?,
            sampled: get("sampled")?,
        };

        let mut state = self.lock();
        if !ttl.is_zero() && state.generation == generation {
            state.histogram = Some(Cached {
                at: Instant::now(),
                generation,
                value: histogram,
            });
        }
        Ok(histogram)
    }

    fn prune(&self) -> Result<u64, EventStoreError> {
        let mut state = self.lock();
        state.last_prune = Instant::now();
        let deleted = self.trim(self.config.max_events)?;
        if deleted > 0 {
            state.generation += 1;
            info!(deleted, max_events = self.config.max_events, "pruned old events");
        }
        Ok(deleted)
    }

    fn count(&self) -> Result<u64, EventStoreError> {
        let n: i64 = self
            .db
            .block_on(sqlx::query_scalar("SELECT COUNT(*) FROM events").fetch_one(self.db.pool()))
            .map_err(|e| map_sqlx_error("count", e))?;
        Ok(as_count(n))
    }

    fn learning_curve(&self, minutes: u32) -> Result<Vec<CurveBucket>, EventStoreError> {
        let cutoff = Utc::now().timestamp().div_euclid(60) - i64::from(minutes);
        let rows = self
            .db
            .block_on(
                sqlx::query(
                    r#"
                    SELECT minute, event_count, high_value_count, surprise_count, total_error, total_utility
                    FROM event_buckets
                    WHERE minute >= ?1
                    ORDER BY minute ASC
                    "#,
                )
                .bind(cutoff)
                .fetch_all(self.db.pool()),
            )
            .map_err(|e| map_sqlx_error("learning_curve", e))?;

        rows.iter()
            .map(|row| {
                let get_err = |e| map_sqlx_error("learning_curve", e);
                let event_count: i64 = row.try_get("event_count").map_err(get_err)?;
                let total_error: f64 = row.try_get("total_error").map_err(get_err)?;
                let total_utility: f64 = row.try_get("total_utility").map_err(get_err)?;
                let n = event_count.max(1) as f64;
                Ok(CurveBucket {
                    minute: row.try_get("minute").map_err(get_err)?,
                    event_count: as_count(event_count),
                    avg_error: total_error / n,
                    high_value_count: as_count(row.try_get("high_value_count").map_err(get_err)?),
                    surprise_count: as_count(row.try_get("surprise_count").map_err(get_err)?),
                    avg_utility: total_utility / n,
                })
            })
            .collect()
    }

    fn stats(&self) -> Result<EventStats, EventStoreError> {
        let row = self
            .db
            .block_on(
                sqlx::query(
                    r#"
                    SELECT COUNT(*)                       AS total,
                           AVG(utility_score)             AS avg_utility,
                           AVG(absolute_error)            AS avg_error,
                           COALESCE(SUM(is_high_value), 0) AS high_value,
                           COALESCE(SUM(is_surprise), 0)   AS surprises,
                           MIN(timestamp)                 AS first,
                           MAX(timestamp)                 AS last
                    FROM events
                    "#,
                )
                .fetch_one(self.db.pool()),
            )
            .map_err(|e| map_sqlx_error("stats", e))?;

        let get_err = |e| map_sqlx_error("stats", e);
        let first: Option<i64> = row.try_get("first").map_err(get_err)?;
        let last: Option<i64> = row.try_get("last").map_err(get_err)?;
        Ok(EventStats {
            total: as_count(row.try_get("total").map_err(get_err)?),
            avg_utility: row.try_get("avg_utility").map_err(get_err)?,
            avg_error: row.try_get("avg_error").map_err(get_err)?,
            high_value: as_count(row.try_get("high_value").map_err(get_err)?),
            surprises: as_count(row.try_get("surprises").map_err(get_err)?),
            first: first.and_then(from_millis),
            last: last.and_then(from_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use chrono::{DateTime, TimeZone};
    use geoscan_ai::Mismatch;

    use super::*;

    fn event(score: f64, at: DateTime<Utc>) -> ScanEvent {
        ScanEvent {
            timestamp: at,
            target_id: None,
            position: Position::new(37.5, -122.1),
            utility_score: score,
            predicted_score: score - 0.5,
            absolute_error: 0.5,
            is_surprise: false,
            mismatches: MismatchSummary::default(),
            features: serde_json::json!({ "has_water": 1.0 }),
            trace: vec!["base 5.0".to_string()],
        }
    }

    fn with_kinds(mut e: ScanEvent, kinds: &[MismatchKind]) -> ScanEvent {
        let mismatches: Vec<Mismatch> = kinds
            .iter()
            .map(|&kind| Mismatch {
                position: e.position,
                kind,
                severity: 0.5,
                description: String::new(),
                observed: 0.0,
                reference: 0.0,
            })
            .collect();
        e.mismatches = MismatchSummary::from_mismatches(&mismatches);
        e
    }

    fn open(config: EventStoreConfig) -> (tempfile::TempDir, SqliteEventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("events.db"), config).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_is_visible_to_every_read() {
        let (_dir, store) = open(EventStoreConfig::default());
        assert!(store.insert(&event(8.0, Utc::now())));

        assert_eq!(store.count().unwrap(), 1);
        let recent = store.recent(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event.utility_score, 8.0);
        assert_eq!(recent[0].event.trace, vec!["base 5.0".to_string()]);

        assert_eq!(store.high_value_rate(Duration::from_secs(60)).unwrap().count, 1);
        assert!(store.insert(&event(9.0, Utc::now())));
        assert_eq!(store.high_value_rate(Duration::from_secs(60)).unwrap().count, 2);
    }

    #[test]
    fn recent_falls_back_to_database_beyond_cache() {
        let mut config = EventStoreConfig::default();
        config.recent_cache = 2;
        let (_dir, store) = open(config);
        let base = Utc::now();
        for i in 0..5 {
            store.insert(&event(i as f64, base + chrono::Duration::milliseconds(i)));
        }

        let cached = store.recent(2).unwrap();
        assert_eq!(cached.iter().map(|e| e.event.utility_score).collect::<Vec<_>>(), vec![4.0, 3.0]);

        let all = store.recent(10).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].event.utility_score, 4.0);
        assert_eq!(all[4].event.utility_score, 0.0);
    }

    #[test]
    fn prune_keeps_most_recent() {
        let config = EventStoreConfig::default()
            .with_max_events(10, 5)
            .with_prune_interval(3600);
        let (_dir, store) = open(config);
        let base = Utc::now();
        for i in 0..25 {
            assert!(store.insert(&event(i as f64, base + chrono::Duration::milliseconds(i))));
        }
        assert_eq!(store.count().unwrap(), 25);

        assert_eq!(store.prune().unwrap(), 15);
        assert_eq!(store.count().unwrap(), 10);
        let oldest = store.recent(10).unwrap().last().unwrap().event.utility_score;
        assert_eq!(oldest, 15.0);
    }

    #[test]
    fn amortised_prune_respects_slack() {
        let config = EventStoreConfig::default()
            .with_max_events(10, 5)
            .with_prune_interval(0);
        let (_dir, store) = open(config);
        for i in 0..40 {
            store.insert(&event(i as f64, Utc::now()));
            assert!(store.count().unwrap() <= 15);
        }
    }

    #[test]
    fn histogram_counts_recent_window() {
        let mut config = EventStoreConfig::default();
        config.histogram_window = 3;
        let (_dir, store) = open(config);
        let base = Utc::now();
        let at = |i| base + chrono::Duration::milliseconds(i);

        store.insert(&with_kinds(event(5.0, at(0)), &[MismatchKind::Flood]));
        store.insert(&with_kinds(event(5.0, at(1)), &[MismatchKind::Slope]));
        let mut surprising = with_kinds(event(5.0, at(2)), &[MismatchKind::Slope, MismatchKind::Utility]);
        surprising.is_surprise = true;
        store.insert(&surprising);
        store.insert(&event(5.0, at(3)));

        let h = store.mismatch_histogram().unwrap();
        assert_eq!(h.sampled, 3);
        assert_eq!(h.count(MismatchKind::Slope), 2);
        assert_eq!(h.utility, 1);
        assert_eq!(h.flood, 0);
        assert_eq!(h.surprise, 1);
    }

    #[test]
    fn buckets_and_stats() {
        let (_dir, store) = open(EventStoreConfig::default());
        let now = Utc::now();
        store.insert(&event(8.0, now));
        store.insert(&event(2.0, now));

        let curve = store.learning_curve(5).unwrap();
        assert_eq!(curve.iter().map(|b| b.event_count).sum::<u64>(), 2);
        assert_eq!(curve.iter().map(|b| b.high_value_count).sum::<u64>(), 1);
        assert!(curve.iter().all(|b| (b.avg_error - 0.5).abs() < 1e-9));

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.high_value, 1);
        assert!((stats.avg_utility.unwrap() - 5.0).abs() < 1e-9);
        assert!(stats.first.is_some());
    }

    #[test]
    fn expired_buckets_are_dropped() {
        let (_dir, store) = open(EventStoreConfig::default());
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        store.insert(&event(5.0, old));
        store.insert(&event(5.0, Utc::now()));

        store.prune().unwrap();
        assert_eq!(store.learning_curve(u32::MAX / 2).unwrap().len(), 1);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn reopen_warms_recent_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        {
            let store = SqliteEventStore::open(&path, EventStoreConfig::default()).unwrap();
            store.insert(&event(3.0, Utc::now()));
        }
        let store = SqliteEventStore::open(&path, EventStoreConfig::default()).unwrap();
        assert_eq!(store.recent(1).unwrap()[0].event.utility_score, 3.0);
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let (_dir, store) = open(EventStoreConfig::default().with_max_events(10_000, 0));
        let store = Arc::new(store);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        assert!(store.insert(&event(6.0, Utc::now())));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.count().unwrap(), 100);
        assert_eq!(store.stats().unwrap().high_value, 100);
    }
}
