use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use geoscan_ai::MismatchSummary;
use geoscan_core::{Position, SiteFeatures, TargetId};
use geoscan_infra::event_store::{EventStore, EventStoreConfig, InMemoryEventStore, ScanEvent, SqliteEventStore};
use geoscan_infra::jobs::{InMemoryJobQueue, JobQueue};

fn event(i: usize) -> ScanEvent {
    let position = Position::new(30.0 + (i % 100) as f64 * 0.001, -97.0 - (i % 37) as f64 * 0.001);
    let features = SiteFeatures::synthetic(position);
    ScanEvent {
        timestamp: Utc::now(),
        target_id: None,
        position,
        utility_score: (i % 11) as f64,
        predicted_score: 5.0,
        absolute_error: ((i % 11) as f64 - 5.0).abs(),
        is_surprise: i % 17 == 0,
        mismatches: MismatchSummary::default(),
        features: serde_json::to_value(&features).unwrap(),
        trace: vec!["baseline".to_string()],
    }
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_insert");
    group.throughput(Throughput::Elements(1));

    let mem = InMemoryEventStore::new(EventStoreConfig::default());
    let mut i = 0;
    group.bench_function("in_memory", |b| {
        b.iter(|| {
            i += 1;
            black_box(mem.insert(&event(i)))
        })
    });

    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteEventStore::open(dir.path().join("events.db"), EventStoreConfig::default()).unwrap();
    let mut i = 0;
    group.bench_function("sqlite", |b| {
        b.iter(|| {
            i += 1;
            black_box(sqlite.insert(&event(i)))
        })
    });

    group.finish();
}

fn bench_aggregates(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_aggregates");

    for size in [100usize, 1000] {
        let dir = tempfile::tempdir().unwrap();
        let config = EventStoreConfig::default().with_max_events(size as u64, 0);
        let store = SqliteEventStore::open(dir.path().join("events.db"), config).unwrap();
        for i in 0..size {
            store.insert(&event(i));
        }

        group.bench_with_input(BenchmarkId::new("recent_cached", size), &size, |b, _| {
            b.iter(|| black_box(store.recent(50).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("mismatch_histogram", size), &size, |b, _| {
            b.iter(|| black_box(store.mismatch_histogram().unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("stats", size), &size, |b, _| {
            b.iter(|| black_box(store.stats().unwrap()))
        });
    }

    group.finish();
}

fn bench_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_claim");
    group.bench_function("enqueue_and_claim_in_memory", |b| {
        let queue = InMemoryJobQueue::new();
        b.iter(|| {
            queue.enqueue(TargetId::new(), 0).unwrap();
            black_box(queue.claim_next("bench").unwrap())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_aggregates, bench_claim);
criterion_main!(benches);
