//! Long-running scan worker.
//!
//! A worker claims one job at a time from the shared queue and runs scan
//! cycles against the job's target until the point budget is spent, the
//! shutdown token fires, or the job fails.
//!
//! ## Guarantees
//!
//! - A claimed job always leaves `running`: it completes, pauses (on
//!   shutdown) or fails. Panics are caught at job granularity.
//! - Terminal queue transitions are retried with backoff on transient
//!   storage errors before being logged.
//! - Progress (`points_collected`) is persisted after every cycle, so a
//!   crash loses at most one cycle of work.

mod scan;

use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use geoscan_ai::{AiError, MismatchDetector, SharedLearner};
use geoscan_core::{JobId, RuleEngine, Target, TargetId, TargetStatus};

use crate::archive::{ArchiveError, ArchiveLog};
use crate::config::WorkerSettings;
use crate::event_store::EventStore;
use crate::fetch::FeatureFetcher;
use crate::heartbeat::{Heartbeat, HeartbeatWriter, WorkerState};
use crate::jobs::{Job, JobQueue, JobQueueError, RetryPolicy, Transition};
use crate::targets::{TargetStore, TargetStoreError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("target {0} not found")]
    TargetNotFound(TargetId),

    #[error(transparent)]
    Queue(#[from] JobQueueError),

    #[error(transparent)]
    Targets(#[from] TargetStoreError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Learner(#[from] AiError),

    #[error("failed to encode features: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0} consecutive scan cycles failed every point")]
    TooManyFailedCycles(u32),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Sleep between empty claims.
    pub poll_interval: Duration,
    /// Running jobs older than this are reclaimed at startup.
    pub stale_after: Duration,
    pub max_failed_cycles: u32,
    /// Granularity of interruptible sleeps.
    pub sleep_slice: Duration,
    /// Fixed seed for candidate points.
    pub seed: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            poll_interval: Duration::from_secs(2),
            stale_after: Duration::from_secs(24 * 60 * 60),
            max_failed_cycles: 3,
            sleep_slice: Duration::from_millis(100),
            seed: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &WorkerSettings, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: settings.poll_interval(),
            stale_after: settings.stale_after(),
            max_failed_cycles: settings.max_failed_cycles,
            sleep_slice: settings.sleep_slice(),
            seed: settings.seed,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, max_age: Duration) -> Self {
        self.stale_after = max_age;
        self
    }

    pub fn with_max_failed_cycles(mut self, n: u32) -> Self {
        self.max_failed_cycles = n;
        self
    }

    pub fn with_sleep_slice(mut self, slice: Duration) -> Self {
        self.sleep_slice = slice;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Everything a worker talks to. Built once per process and cloned into
/// each worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn JobQueue>,
    pub targets: Arc<dyn TargetStore>,
    pub events: Arc<dyn EventStore>,
    pub archive: Arc<ArchiveLog>,
    pub learner: SharedLearner,
    pub detector: MismatchDetector,
    pub fetcher: Arc<dyn FeatureFetcher>,
    pub rules: Arc<dyn RuleEngine>,
    pub heartbeat: Option<HeartbeatWriter>,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub cycles: u64,
    pub points_processed: u64,
    pub points_failed: u64,
    pub high_value_points: u64,
    pub surprises: u64,
    /// Points archived and counted but dropped by the event store.
    pub events_rejected: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_paused: u64,
    pub uptime_secs: u64,
    pub current_job: Option<JobId>,
}

/// How a job left the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    /// Budget spent.
    Completed,
    /// Shutdown requested mid-job.
    Interrupted,
}

/// Handle to control and join a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: String,
    token: CancellationToken,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(self) -> WorkerStats {
        self.token.cancel();
        self.join()
    }

    /// Wait for the worker to stop on its own (its token was cancelled).
    pub fn join(mut self) -> WorkerStats {
        if let Some(j) = self.join.take()
            && j.join().is_err()
        {
            error!(worker = %self.worker_id, "worker thread panicked");
        }
        self.stats()
    }
}

pub struct ScanWorker {
    config: WorkerConfig,
    deps: WorkerDeps,
    rng: StdRng,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl ScanWorker {
    pub fn new(config: WorkerConfig, deps: WorkerDeps) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            deps,
            rng,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            started: Instant::now(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.lock_stats().clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, WorkerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run on a named OS thread until `token` (or the handle) cancels it.
    pub fn spawn(self, token: &CancellationToken) -> Result<WorkerHandle, WorkerError> {
        let token = token.child_token();
        let worker_token = token.clone();
        let worker_id = self.config.worker_id.clone();
        let stats = self.stats.clone();
        let started = self.started;

        let join = thread::Builder::new()
            .name(format!("geoscan-{worker_id}"))
            .spawn(move || {
                let mut worker = self;
                worker.run(&worker_token);
            })
            .map_err(WorkerError::Spawn)?;

        Ok(WorkerHandle {
            worker_id,
            token,
            join: Some(join),
            stats,
            started,
        })
    }

    /// Worker main loop. Returns after `token` is cancelled and the current
    /// job (if any) has been paused.
    pub fn run(&mut self, token: &CancellationToken) {
        info!(worker = %self.config.worker_id, "scan worker started");
        if let Err(e) = self.reclaim_stale() {
            warn!(worker = %self.config.worker_id, error = %e, "stale job reclaim failed");
        }

        while !token.is_cancelled() {
            match self.run_once(token) {
                Ok(true) => {}
                Ok(false) => {
                    self.write_heartbeat(WorkerState::Idle, None);
                    self.sleep(self.config.poll_interval, token);
                }
                Err(e) => {
                    error!(worker = %self.config.worker_id, error = %e, "failed to claim job");
                    self.sleep(self.config.poll_interval, token);
                }
            }
        }

        self.finish();
        let stats = self.stats();
        info!(
            worker = %self.config.worker_id,
            cycles = stats.cycles,
            points = stats.points_processed,
            jobs_completed = stats.jobs_completed,
            "scan worker stopped"
        );
    }

    /// Reset jobs left `running` by crashed workers.
    pub fn reclaim_stale(&self) -> Result<u64, WorkerError> {
        let n = self.deps.queue.reclaim_stale(self.config.stale_after)?;
        if n > 0 {
            info!(worker = %self.config.worker_id, reclaimed = n, "reclaimed stale jobs");
        }
        Ok(n)
    }

    /// Claim and fully process at most one job. Returns whether a job was claimed.
    pub fn run_once(&mut self, token: &CancellationToken) -> Result<bool, WorkerError> {
        if token.is_cancelled() {
            return Ok(false);
        }
        let Some(job) = self.deps.queue.claim_next(&self.config.worker_id)? else {
            return Ok(false);
        };
        self.process_job(job, token);
        Ok(true)
    }

    /// Checkpoint the learner and record the worker as stopped.
    pub fn finish(&mut self) {
        let mut learner = self.deps.learner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = learner.save() {
            warn!(worker = %self.config.worker_id, error = %e, "failed to save learner checkpoint");
        }
        drop(learner);
        self.write_heartbeat(WorkerState::Stopped, None);
    }

    fn process_job(&mut self, job: Job, token: &CancellationToken) {
        let job_id = job.id;
        let target_id = job.target_id;
        info!(worker = %self.config.worker_id, %job_id, %target_id, priority = job.priority, "claimed job");
        self.lock_stats().current_job = Some(job_id);

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.scan_job(&job, token)))
            .unwrap_or_else(|payload| Err(WorkerError::Panicked(panic_message(payload.as_ref()))));

        match result {
            Ok(JobOutcome::Completed) => {
                self.transition(job_id, Transition::Complete);
                self.update_target(target_id, |t| t.set_status(TargetStatus::Completed));
                self.lock_stats().jobs_completed += 1;
                info!(worker = %self.config.worker_id, %job_id, %target_id, "job completed");
            }
            Ok(JobOutcome::Interrupted) => {
                self.transition(job_id, Transition::Pause);
                self.update_target(target_id, |t| t.set_status(TargetStatus::Paused));
                self.lock_stats().jobs_paused += 1;
                info!(worker = %self.config.worker_id, %job_id, %target_id, "job paused for shutdown");
            }
            Err(e) => {
                let reason = e.to_string();
                error!(worker = %self.config.worker_id, %job_id, %target_id, error = %reason, "job failed");
                self.transition(job_id, Transition::Fail(&reason));
                self.update_target(target_id, |t| t.mark_error(reason.clone()));
                self.lock_stats().jobs_failed += 1;
            }
        }

        self.lock_stats().current_job = None;
    }

    /// Apply a queue transition, retrying transient failures.
    fn transition(&self, job_id: JobId, transition: Transition<'_>) -> bool {
        let result = self.with_retry(
            transition.name(),
            JobQueueError::is_transient,
            || self.deps.queue.transition(job_id, transition),
        );
        match result {
            Ok(_) => true,
            Err(e) => {
                error!(
                    worker = %self.config.worker_id,
                    %job_id,
                    action = transition.name(),
                    error = %e,
                    "failed to record job transition"
                );
                false
            }
        }
    }

    fn save_target(&self, target: &Target) -> Result<(), TargetStoreError> {
        self.with_retry(
            "save_target",
            |e: &TargetStoreError| matches!(e, TargetStoreError::Storage(_)),
            || self.deps.targets.save(target),
        )
    }

    /// Best-effort status change on the target record.
    fn update_target(&self, target_id: TargetId, change: impl FnOnce(&mut Target)) {
        match self.deps.targets.get(target_id) {
            Ok(Some(mut target)) => {
                change(&mut target);
                if let Err(e) = self.save_target(&target) {
                    error!(worker = %self.config.worker_id, %target_id, error = %e, "failed to update target");
                }
            }
            Ok(None) => debug!(worker = %self.config.worker_id, %target_id, "target gone, status not recorded"),
            Err(e) => error!(worker = %self.config.worker_id, %target_id, error = %e, "failed to load target"),
        }
    }

    fn with_retry<T, E: Display>(
        &self,
        what: &str,
        transient: impl Fn(&E) -> bool,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E> {
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if transient(&e) && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        worker = %self.config.worker_id,
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep up to `total`, waking early on cancellation. Returns whether the
    /// full duration elapsed.
    fn sleep(&self, total: Duration, token: &CancellationToken) -> bool {
        let deadline = Instant::now() + total;
        let slice = self.config.sleep_slice.max(Duration::from_millis(1));
        while !token.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(slice.min(deadline - now));
        }
        false
    }

    fn write_heartbeat(&self, state: WorkerState, current_target: Option<TargetId>) {
        let Some(writer) = &self.deps.heartbeat else {
            return;
        };
        let learner = self
            .deps
            .learner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics();
        let stats = self.stats();
        writer.write(&Heartbeat {
            worker_id: self.config.worker_id.clone(),
            pid: std::process::id(),
            state,
            cycles: stats.cycles,
            uptime_secs: stats.uptime_secs,
            points_processed: stats.points_processed,
            points_failed: stats.points_failed,
            high_value_total: stats.high_value_points,
            surprise_total: stats.surprises,
            jobs_completed: stats.jobs_completed,
            current_job: stats.current_job,
            current_target,
            learner: Some(learner),
            updated_at: Utc::now(),
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use geoscan_ai::{LearnerConfig, OnlineLearner};
    use geoscan_core::{BoundingBox, Position, RuleScore, RuleTable, SiteFeatures, TargetSettings};

    use super::*;
    use crate::event_store::{
        CurveBucket, EventStats, EventStoreError, InMemoryEventStore, MismatchHistogram, ScanEvent, StoredEvent, WindowRate,
    };
    use crate::fetch::OfflineFetcher;
    use crate::jobs::{InMemoryJobQueue, JobStatus};
    use crate::targets::InMemoryTargetStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        queue: Arc<InMemoryJobQueue>,
        targets: Arc<InMemoryTargetStore>,
        events: Arc<dyn EventStore>,
        deps: WorkerDeps,
    }

    fn fixture_with(events: Arc<dyn EventStore>, rules: Arc<dyn RuleEngine>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InMemoryJobQueue::new());
        let targets = Arc::new(InMemoryTargetStore::new());
        let deps = WorkerDeps {
            queue: queue.clone(),
            targets: targets.clone(),
            events: events.clone(),
            archive: Arc::new(ArchiveLog::open(dir.path().join("archive.jsonl")).unwrap()),
            learner: OnlineLearner::new(LearnerConfig::default()).into_shared(),
            detector: MismatchDetector::default(),
            fetcher: Arc::new(OfflineFetcher),
            rules,
            heartbeat: Some(HeartbeatWriter::new(dir.path().join("heartbeat"))),
        };
        Fixture {
            _dir: dir,
            queue,
            targets,
            events,
            deps,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(InMemoryEventStore::default()), Arc::new(RuleTable::default()))
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id("test-worker")
            .with_seed(42)
            .with_poll_interval(Duration::from_millis(10))
            .with_sleep_slice(Duration::from_millis(1))
            .with_retry(RetryPolicy::no_retry())
    }

    fn target(f: &Fixture, budget: u64, per_cycle: u32) -> Target {
        let bounds = BoundingBox::new(36.9, 37.0, -122.1, -122.0).unwrap();
        let settings = TargetSettings::default()
            .with_max_total_points(budget)
            .with_points_per_cycle(per_cycle)
            .with_scan_interval(Duration::ZERO);
        let t = Target::new("test", bounds, settings).unwrap();
        f.targets.save(&t).unwrap();
        t
    }

    #[test]
    fn completes_budget_across_cycles() {
        let f = fixture();
        let t = target(&f, 25, 10);
        let job_id = f.queue.enqueue(t.id, 0).unwrap();

        let mut worker = ScanWorker::new(config(), f.deps.clone());
        assert!(worker.run_once(&CancellationToken::new()).unwrap());

        let job = f.queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100.0);

        let t = f.targets.get(t.id).unwrap().unwrap();
        assert_eq!(t.points_collected, 25);
        assert_eq!(t.status, TargetStatus::Completed);
        assert_eq!(f.events.count().unwrap(), 25);

        let stats = worker.stats();
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.points_processed, 25);
        assert_eq!(stats.jobs_completed, 1);
        assert!(stats.current_job.is_none());

        for stored in f.events.recent(25).unwrap() {
            let e = stored.event;
            assert!(t.bounds.contains(e.position));
            assert_eq!(e.target_id, Some(t.id));
        }
    }

    #[test]
    fn empty_queue_claims_nothing() {
        let f = fixture();
        let mut worker = ScanWorker::new(config(), f.deps.clone());
        assert!(!worker.run_once(&CancellationToken::new()).unwrap());
    }

    #[test]
    fn missing_target_fails_job() {
        let f = fixture();
        let ghost = TargetId::new();
        let job_id = f.queue.enqueue(ghost, 0).unwrap();

        let mut worker = ScanWorker::new(config(), f.deps.clone());
        worker.run_once(&CancellationToken::new()).unwrap();

        let job = f.queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message, Some(format!("target {ghost} not found")));
        assert_eq!(worker.stats().jobs_failed, 1);
    }

    #[test]
    fn cancelled_token_pauses_claimed_job() {
        let f = fixture();
        let t = target(&f, 100, 10);
        let job_id = f.queue.enqueue(t.id, 0).unwrap();

        // Claim by hand, then process with an already-cancelled token.
        let job = f.queue.claim_next("test-worker").unwrap().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut worker = ScanWorker::new(config(), f.deps.clone());
        worker.process_job(job, &token);

        assert_eq!(f.queue.get(job_id).unwrap().unwrap().status, JobStatus::Paused);
        assert_eq!(f.targets.get(t.id).unwrap().unwrap().status, TargetStatus::Paused);
        assert_eq!(worker.stats().jobs_paused, 1);
    }

    struct RejectingStore;

    impl EventStore for RejectingStore {
        fn insert(&self, _event: &ScanEvent) -> bool {
            false
        }
        fn recent(&self, _n: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
            Ok(Vec::new())
        }
        fn high_value_rate(&self, window: Duration) -> Result<WindowRate, EventStoreError> {
            Ok(WindowRate::new(window, 0))
        }
        fn mismatch_histogram(&self) -> Result<MismatchHistogram, EventStoreError> {
            Ok(Default::default())
        }
        fn prune(&self) -> Result<u64, EventStoreError> {
            Ok(0)
        }
        fn count(&self) -> Result<u64, EventStoreError> {
            Ok(0)
        }
        fn learning_curve(&self, _minutes: u32) -> Result<Vec<CurveBucket>, EventStoreError> {
            Ok(Vec::new())
        }
        fn stats(&self) -> Result<EventStats, EventStoreError> {
            Ok(Default::default())
        }
    }

    #[test]
    fn rejected_events_still_count_archived_points() {
        let f = fixture_with(Arc::new(RejectingStore), Arc::new(RuleTable::default()));
        let t = target(&f, 12, 5);
        let job_id = f.queue.enqueue(t.id, 0).unwrap();

        let mut worker = ScanWorker::new(config().with_max_failed_cycles(2), f.deps.clone());
        worker.run_once(&CancellationToken::new()).unwrap();

        assert_eq!(f.queue.get(job_id).unwrap().unwrap().status, JobStatus::Completed);
        let t = f.targets.get(t.id).unwrap().unwrap();
        assert_eq!(t.points_collected, 12);
        assert_eq!(ArchiveLog::line_count(f.deps.archive.path()).unwrap() as u64, t.points_collected);

        let stats = worker.stats();
        assert_eq!(stats.points_processed, 12);
        assert_eq!(stats.points_failed, 0);
        assert_eq!(stats.events_rejected, 12);
        let learned = f.deps.learner.lock().unwrap().metrics().samples_learned;
        assert_eq!(learned, t.points_collected);
    }

    /// Panics on every call.
    struct BrokenRules;

    impl RuleEngine for BrokenRules {
        fn score(&self, _features: &SiteFeatures) -> RuleScore {
            panic!("rule table unavailable");
        }
    }

    #[test]
    fn repeated_failed_cycles_fail_the_job() {
        let f = fixture_with(Arc::new(InMemoryEventStore::default()), Arc::new(BrokenRules));
        let t = target(&f, 100, 5);
        let job_id = f.queue.enqueue(t.id, 0).unwrap();

        let mut worker = ScanWorker::new(config().with_max_failed_cycles(2), f.deps.clone());
        worker.run_once(&CancellationToken::new()).unwrap();

        let job = f.queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("2 consecutive scan cycles"));

        let t = f.targets.get(t.id).unwrap().unwrap();
        assert_eq!(t.status, TargetStatus::Error);
        assert_eq!(t.points_collected, 0);
        assert_eq!(worker.stats().points_failed, 10);
        assert_eq!(ArchiveLog::line_count(f.deps.archive.path()).unwrap(), 0);
    }

    #[test]
    fn shutdown_during_last_point_completes_the_job() {
        let f = fixture();
        let t = target(&f, 1, 1);
        let job_id = f.queue.enqueue(t.id, 0).unwrap();

        // The shutdown lands while the only point is being fetched.
        let token = CancellationToken::new();
        let trigger = token.clone();
        let mut deps = f.deps.clone();
        deps.fetcher = Arc::new(move |p: Position| {
            trigger.cancel();
            Ok::<_, crate::fetch::FetchError>(SiteFeatures::synthetic(p))
        });

        let mut worker = ScanWorker::new(config(), deps);
        assert!(worker.run_once(&token).unwrap());

        assert!(token.is_cancelled());
        assert_eq!(f.queue.get(job_id).unwrap().unwrap().status, JobStatus::Completed);
        assert_eq!(f.targets.get(t.id).unwrap().unwrap().status, TargetStatus::Completed);
        assert_eq!(worker.stats().jobs_paused, 0);
    }

    /// Panics on every other call.
    struct FlakyRules {
        calls: AtomicUsize,
        inner: RuleTable,
    }

    impl RuleEngine for FlakyRules {
        fn score(&self, features: &SiteFeatures) -> RuleScore {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                panic!("rule table exploded");
            }
            self.inner.score(features)
        }
    }

    #[test]
    fn panicking_point_does_not_abort_cycle() {
        let rules = Arc::new(FlakyRules {
            calls: AtomicUsize::new(0),
            inner: RuleTable::default(),
        });
        let f = fixture_with(Arc::new(InMemoryEventStore::default()), rules);
        let t = target(&f, 6, 6);
        let job_id = f.queue.enqueue(t.id, 0).unwrap();

        let mut worker = ScanWorker::new(config(), f.deps.clone());
        worker.run_once(&CancellationToken::new()).unwrap();

        assert_eq!(f.queue.get(job_id).unwrap().unwrap().status, JobStatus::Completed);
        let stats = worker.stats();
        assert!(stats.points_failed > 0);
        assert_eq!(stats.points_processed, 6);
        assert_eq!(f.targets.get(t.id).unwrap().unwrap().points_collected, 6);
    }

    #[test]
    fn spawned_worker_stops_on_shutdown() {
        let f = fixture();
        let t = target(&f, 10, 5);
        f.queue.enqueue(t.id, 0).unwrap();

        let token = CancellationToken::new();
        let handle = ScanWorker::new(config(), f.deps.clone()).spawn(&token).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while f.queue.stats().unwrap().completed == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = handle.shutdown();

        assert_eq!(stats.jobs_completed, 1);
        assert!(!token.is_cancelled());
        let beat = f.deps.heartbeat.as_ref().unwrap().read("test-worker").unwrap();
        assert_eq!(beat.state, WorkerState::Stopped);
        assert_eq!(beat.points_processed, 10);
    }

    #[test]
    fn seeded_points_are_reproducible() {
        let f = fixture();
        let bounds = BoundingBox::from_center(Position::new(10.0, 10.0), 1.0).unwrap();
        let mut a = ScanWorker::new(config(), f.deps.clone());
        let mut b = ScanWorker::new(config(), f.deps.clone());
        for _ in 0..5 {
            assert_eq!(a.random_point(&bounds), b.random_point(&bounds));
        }
    }
}
