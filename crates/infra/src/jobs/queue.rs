//! Queue boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use geoscan_core::{JobId, TargetId};

use super::types::{Job, JobStats, JobStatus, Transition};

/// Work queue abstraction.
///
/// Every method is a single atomic step against the backing store.
pub trait JobQueue: Send + Sync {
    /// Insert a pending job.
    fn enqueue(&self, target_id: TargetId, priority: i32) -> Result<JobId, JobQueueError>;

    /// Atomically move the highest-priority, oldest pending job to running.
    /// Returns `None` if nothing is pending.
    fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, JobQueueError>;

    /// Advisory, last write wins. Ignored for terminal jobs.
    fn update_progress(&self, job_id: JobId, percent: f64, message: &str) -> Result<(), JobQueueError>;

    /// Apply a state change. No-op transitions return the job unchanged.
    fn transition(&self, job_id: JobId, transition: Transition<'_>) -> Result<Job, JobQueueError>;

    /// Return running jobs started at least `max_age` ago to pending.
    fn reclaim_stale(&self, max_age: Duration) -> Result<u64, JobQueueError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError>;

    /// Pending and running jobs in claim order.
    fn active_jobs(&self) -> Result<Vec<Job>, JobQueueError>;

    /// Every job for a target, newest first.
    fn jobs_for_target(&self, target_id: TargetId) -> Result<Vec<Job>, JobQueueError>;

    fn delete_for_target(&self, target_id: TargetId) -> Result<u64, JobQueueError>;

    fn stats(&self) -> Result<JobStats, JobQueueError>;

    fn complete(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        self.transition(job_id, Transition::Complete)
    }

    fn fail(&self, job_id: JobId, reason: &str) -> Result<Job, JobQueueError> {
        self.transition(job_id, Transition::Fail(reason))
    }

    fn cancel(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        self.transition(job_id, Transition::Cancel)
    }

    fn pause(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        self.transition(job_id, Transition::Pause)
    }

    fn resume(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        self.transition(job_id, Transition::Resume)
    }
}

/// Queue error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobQueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("cannot {action} job {job_id} while {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        action: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobQueueError {
    /// Storage failures may succeed on retry; invariant violations never do.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobQueueError::Storage(_))
    }
}

/// Resolve a transition against the job's current status.
pub(crate) fn check_transition(job: &Job, transition: Transition<'_>) -> Result<bool, JobQueueError> {
    if transition.allowed_from().contains(&job.status) {
        return Ok(true);
    }
    if transition.is_noop_for(job.status) {
        return Ok(false);
    }
    Err(JobQueueError::InvalidTransition {
        job_id: job.id,
        from: job.status,
        action: transition.name(),
    })
}

/// `now - max_age`, or `None` when that predates every representable time.
pub(crate) fn stale_cutoff(max_age: Duration) -> Option<chrono::DateTime<Utc>> {
    chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|d| Utc::now().checked_sub_signed(d))
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, (u64, Job)>,
    next_seq: u64,
}

impl Inner {
    fn ordered<'a>(&'a self, pred: impl Fn(&Job) -> bool) -> Vec<&'a (u64, Job)> {
        let mut v: Vec<_> = self.jobs.values().filter(|(_, j)| pred(j)).collect();
        v.sort_by(|(sa, a), (sb, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(sa.cmp(sb))
        });
        v
    }
}

/// In-memory queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    inner: RwLock<Inner>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobQueueError> {
        self.inner
            .read()
            .map_err(|_| JobQueueError::Storage("queue lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobQueueError> {
        self.inner
            .write()
            .map_err(|_| JobQueueError::Storage("queue lock poisoned".to_string()))
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, target_id: TargetId, priority: i32) -> Result<JobId, JobQueueError> {
        let mut inner = self.write()?;
        let job = Job::new(target_id, priority);
        let id = job.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(id, (seq, job));
        Ok(id)
    }

    fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, JobQueueError> {
        let mut inner = self.write()?;
        let next = inner
            .ordered(|j| j.status == JobStatus::Pending)
            .first()
            .map(|(_, j)| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let (_, job) = inner.jobs.get_mut(&id).ok_or(JobQueueError::NotFound(id))?;
        job.mark_running(worker_id, Utc::now());
        Ok(Some(job.clone()))
    }

    fn update_progress(&self, job_id: JobId, percent: f64, message: &str) -> Result<(), JobQueueError> {
        let mut inner = self.write()?;
        let (_, job) = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobQueueError::NotFound(job_id))?;
        if !job.status.is_terminal() {
            job.progress_percent = percent.clamp(0.0, 100.0);
            job.progress_message = Some(message.to_string());
        }
        Ok(())
    }

    fn transition(&self, job_id: JobId, transition: Transition<'_>) -> Result<Job, JobQueueError> {
        let mut inner = self.write()?;
        let (_, job) = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobQueueError::NotFound(job_id))?;
        if check_transition(job, transition)? {
            job.apply(transition, Utc::now());
        }
        Ok(job.clone())
    }

    fn reclaim_stale(&self, max_age: Duration) -> Result<u64, JobQueueError> {
        let Some(cutoff) = stale_cutoff(max_age) else {
            return Ok(0);
        };
        let mut inner = self.write()?;
        let mut n = 0;
        for (_, job) in inner.jobs.values_mut() {
            let stale = job.status == JobStatus::Running && job.started_at.is_none_or(|t| t <= cutoff);
            if stale {
                job.reset_stale();
                n += 1;
            }
        }
        Ok(n)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        Ok(self.read()?.jobs.get(&job_id).map(|(_, j)| j.clone()))
    }

    fn active_jobs(&self) -> Result<Vec<Job>, JobQueueError> {
        let inner = self.read()?;
        Ok(inner
            .ordered(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
            .into_iter()
            .map(|(_, j)| j.clone())
            .collect())
    }

    fn jobs_for_target(&self, target_id: TargetId) -> Result<Vec<Job>, JobQueueError> {
        let inner = self.read()?;
        let mut v: Vec<_> = inner
            .jobs
            .values()
            .filter(|(_, j)| j.target_id == target_id)
            .collect();
        v.sort_by(|(sa, a), (sb, b)| b.created_at.cmp(&a.created_at).then(sb.cmp(sa)));
        Ok(v.into_iter().map(|(_, j)| j.clone()).collect())
    }

    fn delete_for_target(&self, target_id: TargetId) -> Result<u64, JobQueueError> {
        let mut inner = self.write()?;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, (_, j)| j.target_id != target_id);
        Ok((before - inner.jobs.len()) as u64)
    }

    fn stats(&self) -> Result<JobStats, JobQueueError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for (_, job) in inner.jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}
