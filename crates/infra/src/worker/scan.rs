use std::panic::{self, AssertUnwindSafe};
use std::sync::PoisonError;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use geoscan_ai::{MismatchSummary, Sample};
use geoscan_core::{BoundingBox, Position, Target, TargetStatus};

use super::{JobOutcome, ScanWorker, WorkerError, panic_message};
use crate::archive::ArchiveRecord;
use crate::event_store::ScanEvent;
use crate::fetch::fetch_or_synthesize;
use crate::heartbeat::WorkerState;
use crate::jobs::Job;

/// Result of one batch of points.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct CycleReport {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub high_value: u64,
    pub surprises: u64,
    /// Archived but not in the event store.
    pub events_rejected: u64,
    /// Stopped early on shutdown.
    pub interrupted: bool,
}

/// What one scored point contributed.
#[derive(Debug, Clone, Copy)]
struct PointResult {
    high_value: bool,
    surprise: bool,
    /// Reached the event store as well as the archive.
    stored: bool,
}

impl ScanWorker {
    /// Run cycles until the target's budget is spent or shutdown is requested.
    pub(super) fn scan_job(&mut self, job: &Job, token: &CancellationToken) -> Result<JobOutcome, WorkerError> {
        let mut target = self
            .deps
            .targets
            .get(job.target_id)?
            .ok_or(WorkerError::TargetNotFound(job.target_id))?;
        target.set_status(TargetStatus::Scanning);
        self.save_target(&target)?;

        let mut failed_cycles = 0u32;
        loop {
            if target.is_budget_exhausted() {
                return Ok(JobOutcome::Completed);
            }
            if token.is_cancelled() {
                return Ok(JobOutcome::Interrupted);
            }

            let report = self.run_cycle(&target, token);
            target.record_points(report.succeeded);
            self.save_target(&target)?;

            let message = format!(
                "Collected {}/{} points",
                target.points_collected, target.settings.max_total_points
            );
            if let Err(e) = self
                .deps
                .queue
                .update_progress(job.id, target.progress_percent(), &message)
            {
                debug!(worker = %self.config.worker_id, job_id = %job.id, error = %e, "progress update failed");
            }

            {
                let mut stats = self.lock_stats();
                stats.cycles += 1;
                stats.points_processed += report.succeeded;
                stats.points_failed += report.failed;
                stats.high_value_points += report.high_value;
                stats.surprises += report.surprises;
                stats.events_rejected += report.events_rejected;
            }
            self.write_heartbeat(WorkerState::Scanning, Some(target.id));
            self.checkpoint_learner();

            info!(
                worker = %self.config.worker_id,
                job_id = %job.id,
                target_id = %target.id,
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                high_value = report.high_value,
                surprises = report.surprises,
                collected = target.points_collected,
                "scan cycle finished"
            );

            if report.attempted > 0 && report.succeeded == 0 {
                failed_cycles += 1;
                warn!(
                    worker = %self.config.worker_id,
                    job_id = %job.id,
                    failed_cycles,
                    "every point in the cycle failed"
                );
                if failed_cycles >= self.config.max_failed_cycles {
                    return Err(WorkerError::TooManyFailedCycles(failed_cycles));
                }
            } else {
                failed_cycles = 0;
            }

            if target.is_budget_exhausted() {
                return Ok(JobOutcome::Completed);
            }
            if report.interrupted || token.is_cancelled() {
                return Ok(JobOutcome::Interrupted);
            }
            if !self.sleep(target.settings.scan_interval, token) {
                return Ok(JobOutcome::Interrupted);
            }
        }
    }

    /// Score one batch of random points inside the target's bounds.
    pub(super) fn run_cycle(&mut self, target: &Target, token: &CancellationToken) -> CycleReport {
        let batch = u64::from(target.settings.points_per_cycle).min(target.remaining_points());
        let mut report = CycleReport::default();

        for _ in 0..batch {
            if token.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let position = self.random_point(&target.bounds);
            report.attempted += 1;

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process_point(target, position)))
                .unwrap_or_else(|payload| Err(WorkerError::Panicked(panic_message(payload.as_ref()))));
            match outcome {
                Ok(point) => {
                    report.succeeded += 1;
                    report.high_value += u64::from(point.high_value);
                    report.surprises += u64::from(point.surprise);
                    report.events_rejected += u64::from(!point.stored);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        worker = %self.config.worker_id,
                        target_id = %target.id,
                        %position,
                        error = %e,
                        "point failed"
                    );
                }
            }
        }
        report
    }

    /// Uniform point inside `bounds`.
    pub(super) fn random_point(&mut self, bounds: &BoundingBox) -> Position {
        let lat = self.rng.random_range(bounds.min_lat..=bounds.max_lat);
        let lon = self.rng.random_range(bounds.min_lon..=bounds.max_lon);
        Position::new(lat, lon)
    }

    /// Fetch, score, learn, detect, archive and record one point.
    ///
    /// Fails only when the point never reached the learner or the archive.
    fn process_point(&self, target: &Target, position: Position) -> Result<PointResult, WorkerError> {
        let (features, fetch_err) = fetch_or_synthesize(self.deps.fetcher.as_ref(), position);
        if let Some(e) = fetch_err {
            debug!(worker = %self.config.worker_id, %position, error = %e, "using synthetic features");
        }

        let rule = self.deps.rules.score(&features);

        let (was_ready, outcome) = {
            let mut learner = self.deps.learner.lock().unwrap_or_else(PoisonError::into_inner);
            let was_ready = learner.is_ready();
            let outcome = learner.learn(&features.to_feature_map(), rule.score)?;
            (was_ready, outcome)
        };

        let sample = Sample {
            position,
            features: &features,
            rule_score: rule.score,
            predicted_score: was_ready.then_some(outcome.prediction),
        };
        let mismatches = self.deps.detector.scan(&sample);
        if outcome.drift_detected {
            info!(worker = %self.config.worker_id, %position, "concept drift detected");
        }

        let event = ScanEvent {
            timestamp: Utc::now(),
            target_id: Some(target.id),
            position,
            utility_score: rule.score,
            predicted_score: outcome.prediction,
            absolute_error: outcome.error,
            is_surprise: outcome.is_surprise,
            mismatches: MismatchSummary::from_mismatches(&mismatches),
            features: serde_json::to_value(&features)?,
            trace: rule.trace,
        };

        self.deps.archive.append(&ArchiveRecord::from_event(&event))?;
        // The archive is the record of the point; the live view may lag.
        let stored = self.deps.events.insert(&event);
        if !stored {
            warn!(worker = %self.config.worker_id, %position, "event store rejected event; point kept in archive");
        }

        Ok(PointResult {
            high_value: event.is_high_value(target.settings.high_value_threshold),
            surprise: event.is_surprise,
            stored,
        })
    }

    fn checkpoint_learner(&self) {
        let mut learner = self.deps.learner.lock().unwrap_or_else(PoisonError::into_inner);
        match learner.maybe_checkpoint() {
            Ok(true) => debug!(worker = %self.config.worker_id, "learner checkpoint written"),
            Ok(false) => {}
            Err(e) => warn!(worker = %self.config.worker_id, error = %e, "learner checkpoint failed"),
        }
    }
}
