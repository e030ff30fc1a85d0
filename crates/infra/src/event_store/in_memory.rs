use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;

use super::r#trait::{
    CurveBucket, EventStats, EventStore, EventStoreConfig, EventStoreError, MismatchHistogram,
    ScanEvent, StoredEvent, WindowRate,
};

#[derive(Debug)]
struct Inner {
    /// Oldest first.
    events: VecDeque<StoredEvent>,
    next_id: i64,
    last_prune: Instant,
}

/// In-memory event ring buffer.
///
/// Intended for tests/dev. Aggregates are computed on every call and the
/// learning curve only covers retained events.
#[derive(Debug)]
pub struct InMemoryEventStore {
    config: EventStoreConfig,
    inner: Mutex<Inner>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(EventStoreConfig::default())
    }
}

impl InMemoryEventStore {
    pub fn new(config: EventStoreConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                next_id: 1,
                last_prune: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trim(&self, inner: &mut Inner, threshold: u64) -> u64 {
        let len = inner.events.len() as u64;
        if len <= threshold {
            return 0;
        }
        let excess = (len - self.config.max_events) as usize;
        inner
            .events
            .make_contiguous()
            .sort_by_key(|e| (e.event.timestamp, e.id));
        inner.events.drain(..excess);
        excess as u64
    }
}

impl EventStore for InMemoryEventStore {
    fn insert(&self, event: &ScanEvent) -> bool {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.events.push_back(StoredEvent {
            id,
            event: event.clone(),
        });

        if inner.last_prune.elapsed() >= self.config.prune_interval() {
            inner.last_prune = Instant::now();
            let threshold = self.config.max_events.saturating_add(self.config.prune_slack);
            self.trim(&mut inner, threshold);
        }
        true
    }

    fn recent(&self, n: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        Ok(self.lock().events.iter().rev().take(n).cloned().collect())
    }

    fn high_value_rate(&self, window: Duration) -> Result<WindowRate, EventStoreError> {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w));
        let threshold = self.config.high_value_threshold;
        let count = self
            .lock()
            .events
            .iter()
            .filter(|e| cutoff.is_none_or(|c| e.event.timestamp > c))
            .filter(|e| e.event.is_high_value(threshold))
            .count();
        Ok(WindowRate::new(window, count as u64))
    }

    fn mismatch_histogram(&self) -> Result<MismatchHistogram, EventStoreError> {
        let window = usize::try_from(self.config.histogram_window).unwrap_or(usize::MAX);
        let mut histogram = MismatchHistogram::default();
        for e in self.lock().events.iter().rev().take(window) {
            histogram.record(&e.event);
        }
        Ok(histogram)
    }

    fn prune(&self) -> Result<u64, EventStoreError> {
        let mut inner = self.lock();
        inner.last_prune = Instant::now();
        Ok(self.trim(&mut inner, self.config.max_events))
    }

    fn count(&self) -> Result<u64, EventStoreError> {
        Ok(self.lock().events.len() as u64)
    }

    fn learning_curve(&self, minutes: u32) -> Result<Vec<CurveBucket>, EventStoreError> {
        let cutoff = Utc::now().timestamp().div_euclid(60) - i64::from(minutes);
        let threshold = self.config.high_value_threshold;
        let mut buckets: BTreeMap<i64, CurveBucket> = BTreeMap::new();

        for e in self.lock().events.iter() {
            let minute = e.event.timestamp.timestamp().div_euclid(60);
            if minute < cutoff {
                continue;
            }
            let b = buckets.entry(minute).or_insert(CurveBucket {
                minute,
                event_count: 0,
                avg_error: 0.0,
                high_value_count: 0,
                surprise_count: 0,
                avg_utility: 0.0,
            });
            b.event_count += 1;
            // Running sums; divided below.
            b.avg_error += e.event.absolute_error;
            b.avg_utility += e.event.utility_score;
            b.high_value_count += u64::from(e.event.is_high_value(threshold));
            b.surprise_count += u64::from(e.event.is_surprise);
        }

        Ok(buckets
            .into_values()
            .map(|mut b| {
                let n = b.event_count as f64;
                b.avg_error /= n;
                b.avg_utility /= n;
                b
            })
            .collect())
    }

    fn stats(&self) -> Result<EventStats, EventStoreError> {
        let inner = self.lock();
        let events = &inner.events;
        let total = events.len() as u64;
        let mean = |f: fn(&ScanEvent) -> f64| {
            (total > 0).then(|| events.iter().map(|e| f(&e.event)).sum::<f64>() / total as f64)
        };
        Ok(EventStats {
            total,
            avg_utility: mean(|e| e.utility_score),
            avg_error: mean(|e| e.absolute_error),
            high_value: events
                .iter()
                .filter(|e| e.event.is_high_value(self.config.high_value_threshold))
                .count() as u64,
            surprises: events.iter().filter(|e| e.event.is_surprise).count() as u64,
            first: events.iter().map(|e| e.event.timestamp).min(),
            last: events.iter().map(|e| e.event.timestamp).max(),
        })
    }
}

#[cfg(test)]
mod tests {
    use geoscan_ai::MismatchSummary;
    use geoscan_core::Position;

    use super::*;

    fn event(score: f64) -> ScanEvent {
        ScanEvent {
            timestamp: Utc::now(),
            target_id: None,
            position: Position::new(0.0, 0.0),
            utility_score: score,
            predicted_score: 0.0,
            absolute_error: score,
            is_surprise: score > 8.0,
            mismatches: MismatchSummary::default(),
            features: serde_json::Value::Null,
            trace: Vec::new(),
        }
    }

    #[test]
    fn prune_trims_oldest() {
        let store = InMemoryEventStore::new(
            EventStoreConfig::default()
                .with_max_events(3, 1)
                .with_prune_interval(3600),
        );
        for i in 0..6 {
            store.insert(&event(i as f64));
        }
        assert_eq!(store.prune().unwrap(), 3);
        let scores: Vec<f64> = store
            .recent(10)
            .unwrap()
            .iter()
            .map(|e| e.event.utility_score)
            .collect();
        assert_eq!(scores, vec![5.0, 4.0, 3.0]);
    }

    #[test]
    fn aggregates() {
        let store = InMemoryEventStore::default();
        store.insert(&event(9.0));
        store.insert(&event(1.0));

        assert_eq!(store.high_value_rate(Duration::from_secs(60)).unwrap().count, 1);
        assert_eq!(store.mismatch_histogram().unwrap().surprise, 1);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.avg_utility, Some(5.0));

        let curve = store.learning_curve(5).unwrap();
        assert_eq!(curve.iter().map(|b| b.event_count).sum::<u64>(), 2);
    }
}
