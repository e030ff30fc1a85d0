//! SQLite-backed work queue.
//!
//! ## Claim
//!
//! `claim_next` is one statement:
//!
//! ```sql
//! UPDATE jobs SET status = 'running', ...
//! WHERE seq = (SELECT seq FROM jobs WHERE status = 'pending'
//!              ORDER BY priority DESC, created_at ASC, seq ASC LIMIT 1)
//!   AND status = 'pending'
//! RETURNING ...
//! ```
//!
//! SQLite runs the subquery and the update under one write lock, so two
//! callers (threads or processes) can never both see the same row as
//! pending. Transitions use the same compare-and-update shape: the `WHERE`
//! clause names the statuses the transition may start from.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::debug;

use geoscan_core::{JobId, TargetId};

use crate::db::{Database, DatabaseError, STATE_SCHEMA, describe_sqlx_error, from_millis, to_millis};

use super::queue::{JobQueue, JobQueueError, check_transition, stale_cutoff};
use super::types::{Job, JobStats, JobStatus, Transition};

const JOB_COLUMNS: &str = "id, target_id, status, priority, created_at, started_at, completed_at, \
     progress_percent, progress_message, error_message, worker_id";

/// Durable queue shared by every worker.
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    db: Database,
}

impl SqliteJobQueue {
    /// Use a database already prepared with the state schema.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open (or create) the state database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        Ok(Self::new(Database::open(path, &STATE_SCHEMA)?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(job_id.to_string())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn try_transition(
        &self,
        job_id: JobId,
        transition: Transition<'_>,
    ) -> Result<Option<Job>, JobQueueError> {
        let from = transition
            .allowed_from()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let extra = match transition {
            Transition::Complete => ", progress_percent = 100, completed_at = ?4",
            Transition::Fail(_) => ", completed_at = ?4, error_message = ?5",
            Transition::Cancel => ", completed_at = ?4",
            Transition::Pause => "",
            Transition::Resume => ", worker_id = NULL, started_at = NULL",
        };

        let sql = format!(
            "UPDATE jobs SET status = ?1, progress_message = ?2{extra} \
             WHERE id = ?3 AND status IN ({from}) RETURNING {JOB_COLUMNS}"
        );

        let mut query = sqlx::query(&sql)
            .bind(transition.target_status().as_str())
            .bind(transition.progress_message())
            .bind(job_id.to_string());
        if matches!(
            transition,
            Transition::Complete | Transition::Fail(_) | Transition::Cancel
        ) {
            query = query.bind(to_millis(Utc::now()));
        }
        if let Transition::Fail(reason) = transition {
            query = query.bind(reason);
        }

        let row = query
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error(transition.name(), e))?;
        row.as_ref().map(job_from_row).transpose()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobQueueError {
    JobQueueError::Storage(describe_sqlx_error(operation, err))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, JobQueueError> {
    let decode = |e: sqlx::Error| JobQueueError::Storage(format!("failed to decode job row: {e}"));
    let bad = |what: &str, v: &str| JobQueueError::Storage(format!("invalid {what} in job row: {v}"));

    let id: String = row.try_get("id").map_err(decode)?;
    let target_id: String = row.try_get("target_id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let created_at: i64 = row.try_get("created_at").map_err(decode)?;
    let started_at: Option<i64> = row.try_get("started_at").map_err(decode)?;
    let completed_at: Option<i64> = row.try_get("completed_at").map_err(decode)?;

    Ok(Job {
        id: id.parse().map_err(|_| bad("id", &id))?,
        target_id: target_id.parse().map_err(|_| bad("target_id", &target_id))?,
        status: JobStatus::parse(&status).ok_or_else(|| bad("status", &status))?,
        priority: row.try_get("priority").map_err(decode)?,
        created_at: from_millis(created_at).ok_or_else(|| bad("created_at", &created_at.to_string()))?,
        started_at: started_at.and_then(from_millis),
        completed_at: completed_at.and_then(from_millis),
        progress_percent: row.try_get("progress_percent").map_err(decode)?,
        progress_message: row.try_get("progress_message").map_err(decode)?,
        error_message: row.try_get("error_message").map_err(decode)?,
        worker_id: row.try_get("worker_id").map_err(decode)?,
    })
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, target_id: TargetId, priority: i32) -> Result<JobId, JobQueueError> {
        let job = Job::new(target_id, priority);
        self.db.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO jobs (id, target_id, status, priority, created_at, progress_percent)
                VALUES (?1, ?2, ?3, ?4, ?5, 0)
                "#,
            )
            .bind(job.id.to_string())
            .bind(job.target_id.to_string())
            .bind(job.status.as_str())
            .bind(job.priority)
            .bind(to_millis(job.created_at))
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))
        })?;
        debug!(job_id = %job.id, target_id = %target_id, priority, "enqueued job");
        Ok(job.id)
    }

    fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, JobQueueError> {
        self.db.block_on(async {
            let row = sqlx::query(&format!(
                r#"
                UPDATE jobs
                SET status = 'running', started_at = ?1, worker_id = ?2, progress_message = 'Starting...'
                WHERE seq = (
                    SELECT seq FROM jobs
                    WHERE status = 'pending'
                    ORDER BY priority DESC, created_at ASC, seq ASC
                    LIMIT 1
                )
                AND status = 'pending'
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(to_millis(Utc::now()))
            .bind(worker_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
            row.as_ref().map(job_from_row).transpose()
        })
    }

    fn update_progress(&self, job_id: JobId, percent: f64, message: &str) -> Result<(), JobQueueError> {
        self.db.block_on(async {
            let done = sqlx::query(
                r#"
                UPDATE jobs SET progress_percent = ?1, progress_message = ?2
                WHERE id = ?3 AND status NOT IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(percent.clamp(0.0, 100.0))
            .bind(message)
            .bind(job_id.to_string())
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("update_progress", e))?;

            if done.rows_affected() == 0 && self.fetch(job_id).await?.is_none() {
                return Err(JobQueueError::NotFound(job_id));
            }
            Ok(())
        })
    }

    fn transition(&self, job_id: JobId, transition: Transition<'_>) -> Result<Job, JobQueueError> {
        self.db.block_on(async {
            // A lost race re-reads and retries; bounded to avoid spinning.
            for _ in 0..3 {
                if let Some(job) = self.try_transition(job_id, transition).await? {
                    return Ok(job);
                }
                let job = self
                    .fetch(job_id)
                    .await?
                    .ok_or(JobQueueError::NotFound(job_id))?;
                if !check_transition(&job, transition)? {
                    return Ok(job);
                }
            }
            Err(JobQueueError::Storage(format!(
                "{} on job {job_id} kept losing to concurrent updates",
                transition.name()
            )))
        })
    }

    fn reclaim_stale(&self, max_age: Duration) -> Result<u64, JobQueueError> {
        let Some(cutoff) = stale_cutoff(max_age) else {
            return Ok(0);
        };
        self.db.block_on(async {
            let done = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending', worker_id = NULL, started_at = NULL,
                    progress_message = 'Reset after timeout'
                WHERE status = 'running' AND (started_at IS NULL OR started_at <= ?1)
                "#,
            )
            .bind(to_millis(cutoff))
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("reclaim_stale", e))?;
            Ok(done.rows_affected())
        })
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        self.db.block_on(self.fetch(job_id))
    }

    fn active_jobs(&self) -> Result<Vec<Job>, JobQueueError> {
        self.db.block_on(async {
            let rows = sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ('pending', 'running') \
                 ORDER BY priority DESC, created_at ASC, seq ASC"
            ))
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("active_jobs", e))?;
            rows.iter().map(job_from_row).collect()
        })
    }

    fn jobs_for_target(&self, target_id: TargetId) -> Result<Vec<Job>, JobQueueError> {
        self.db.block_on(async {
            let rows = sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE target_id = ?1 ORDER BY created_at DESC, seq DESC"
            ))
            .bind(target_id.to_string())
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("jobs_for_target", e))?;
            rows.iter().map(job_from_row).collect()
        })
    }

    fn delete_for_target(&self, target_id: TargetId) -> Result<u64, JobQueueError> {
        self.db.block_on(async {
            let done = sqlx::query("DELETE FROM jobs WHERE target_id = ?1")
                .bind(target_id.to_string())
                .execute(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("delete_for_target", e))?;
            Ok(done.rows_affected())
        })
    }

    fn stats(&self) -> Result<JobStats, JobQueueError> {
        self.db.block_on(async {
            let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
                .fetch_all(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("stats", e))?;

            let mut stats = JobStats::default();
            for row in rows {
                let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
                let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
                if let Some(s) = JobStatus::parse(&status) {
                    stats.add(s, n.max(0) as u64);
                }
            }
            Ok(stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    fn open() -> (tempfile::TempDir, SqliteJobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let q = SqliteJobQueue::open(dir.path().join("state.db")).unwrap();
        (dir, q)
    }

    #[test]
    fn claim_order_and_exhaustion() {
        let (_dir, q) = open();
        let t = TargetId::new();
        let a = q.enqueue(t, 0).unwrap();
        let b = q.enqueue(t, 3).unwrap();

        let first = q.claim_next("w1").unwrap().unwrap();
        assert_eq!(first.id, b);
        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(first.worker_id.as_deref(), Some("w1"));
        assert!(first.started_at.is_some());

        assert_eq!(q.claim_next("w1").unwrap().unwrap().id, a);
        assert!(q.claim_next("w1").unwrap().is_none());
    }

    #[test]
    fn lifecycle_and_idempotence() {
        let (_dir, q) = open();
        let id = q.enqueue(TargetId::new(), 0).unwrap();
        q.claim_next("w").unwrap();

        let paused = q.pause(id).unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(q.pause(id).unwrap().status, JobStatus::Paused);

        let resumed = q.resume(id).unwrap();
        assert_eq!(resumed.status, JobStatus::Pending);
        assert!(resumed.worker_id.is_none());

        q.claim_next("w2").unwrap();
        let failed = q.fail(id, "disk on fire").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("disk on fire"));
        assert!(failed.completed_at.is_some());

        let again = q.complete(id).unwrap();
        assert_eq!(again.status, JobStatus::Failed);
        assert!(matches!(q.resume(id), Err(JobQueueError::InvalidTransition { .. })));
        assert!(matches!(q.cancel(JobId::new()), Err(JobQueueError::NotFound(_))));
    }

    #[test]
    fn reclaim_stale_respects_age() {
        let (_dir, q) = open();
        let id = q.enqueue(TargetId::new(), 0).unwrap();
        q.claim_next("w").unwrap();

        assert_eq!(q.reclaim_stale(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(q.reclaim_stale(Duration::ZERO).unwrap(), 1);

        let job = q.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none());
        assert_eq!(job.progress_message.as_deref(), Some("Reset after timeout"));
    }

    #[test]
    fn progress_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let id = {
            let q = SqliteJobQueue::open(&path).unwrap();
            let id = q.enqueue(TargetId::new(), 0).unwrap();
            q.claim_next("w").unwrap();
            q.update_progress(id, 50.0, "halfway").unwrap();
            id
        };

        let q = SqliteJobQueue::open(&path).unwrap();
        let job = q.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress_percent, 50.0);
        assert_eq!(job.progress_message.as_deref(), Some("halfway"));
        assert_eq!(q.complete(id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn concurrent_claims_are_exclusive() {
        let (_dir, q) = open();
        let t = TargetId::new();
        let total = 40;
        for _ in 0..total {
            q.enqueue(t, 0).unwrap();
        }

        let q = Arc::new(q);
        let workers = 6;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|i| {
                let q = q.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut mine = Vec::new();
                    while let Some(job) = q.claim_next(&format!("w{i}")).unwrap() {
                        mine.push(job.id);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), total);
        assert_eq!(q.stats().unwrap().running, total as u64);
    }

    #[test]
    fn stats_and_target_history() {
        let (_dir, q) = open();
        let t = TargetId::new();
        let first = q.enqueue(t, 0).unwrap();
        let second = q.enqueue(t, 0).unwrap();
        q.enqueue(TargetId::new(), 0).unwrap();
        q.cancel(first).unwrap();

        let history = q.jobs_for_target(t).unwrap();
        assert_eq!(history.iter().map(|j| j.id).collect::<Vec<_>>(), vec![second, first]);

        let stats = q.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(q.active_jobs().unwrap().len(), 2);

        assert_eq!(q.delete_for_target(t).unwrap(), 2);
        assert_eq!(q.stats().unwrap().total(), 1);
    }
}
