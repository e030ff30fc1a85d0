//! Job record, state machine and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use geoscan_core::{JobId, TargetId};

/// Job lifecycle.
///
/// ```text
/// pending -> running -> completed | failed | cancelled
/// running -> paused -> pending        (pause / resume)
/// running -> pending                  (stale reclaim)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<'a> {
    Complete,
    Fail(&'a str),
    Cancel,
    Pause,
    Resume,
}

impl Transition<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Complete => "complete",
            Transition::Fail(_) => "fail",
            Transition::Cancel => "cancel",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
        }
    }

    /// Statuses the transition may start from.
    pub fn allowed_from(&self) -> &'static [JobStatus] {
        match self {
            Transition::Complete | Transition::Pause => &[JobStatus::Running],
            Transition::Fail(_) | Transition::Cancel => {
                &[JobStatus::Pending, JobStatus::Running, JobStatus::Paused]
            }
            Transition::Resume => &[JobStatus::Paused],
        }
    }

    pub fn target_status(&self) -> JobStatus {
        match self {
            Transition::Complete => JobStatus::Completed,
            Transition::Fail(_) => JobStatus::Failed,
            Transition::Cancel => JobStatus::Cancelled,
            Transition::Pause => JobStatus::Paused,
            Transition::Resume => JobStatus::Pending,
        }
    }

    pub fn progress_message(&self) -> &'static str {
        match self {
            Transition::Complete => "Completed",
            Transition::Fail(_) => "Failed",
            Transition::Cancel => "Cancelled",
            Transition::Pause => "Paused",
            Transition::Resume => "Resumed",
        }
    }

    /// A job already in `status` needs no change: terminal transitions on
    /// terminal jobs, and pausing a paused job.
    pub fn is_noop_for(&self, status: JobStatus) -> bool {
        match self {
            Transition::Complete | Transition::Fail(_) | Transition::Cancel => status.is_terminal(),
            Transition::Pause => status == JobStatus::Paused,
            Transition::Resume => false,
        }
    }
}

/// A queued scan of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target_id: TargetId,
    pub status: JobStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_percent: f64,
    pub progress_message: Option<String>,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
}

impl Job {
    pub fn new(target_id: TargetId, priority: i32) -> Self {
        Self {
            id: JobId::new(),
            target_id,
            status: JobStatus::Pending,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress_percent: 0.0,
            progress_message: None,
            error_message: None,
            worker_id: None,
        }
    }

    pub fn mark_running(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.worker_id = Some(worker_id.to_string());
        self.progress_message = Some("Starting...".to_string());
    }

    /// Apply an already-validated transition.
    pub fn apply(&mut self, transition: Transition<'_>, now: DateTime<Utc>) {
        self.status = transition.target_status();
        self.progress_message = Some(transition.progress_message().to_string());
        match transition {
            Transition::Complete => {
                self.progress_percent = 100.0;
                self.completed_at = Some(now);
            }
            Transition::Fail(reason) => {
                self.error_message = Some(reason.to_string());
                self.completed_at = Some(now);
            }
            Transition::Cancel => {
                self.completed_at = Some(now);
            }
            Transition::Pause => {}
            Transition::Resume => {
                self.worker_id = None;
                self.started_at = None;
            }
        }
    }

    pub fn reset_stale(&mut self) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.started_at = None;
        self.progress_message = Some("Reset after timeout".to_string());
    }
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub paused: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Running => self.running += n,
            JobStatus::Paused => self.paused += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.paused + self.completed + self.failed + self.cancelled
    }
}

/// Exponential backoff for retrying queue writes that must not be lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-indexed): base * 2^(attempt-1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in JobStatus::ALL {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("dead"), None);
    }

    #[test]
    fn transition_table() {
        assert!(Transition::Complete.is_noop_for(JobStatus::Failed));
        assert!(!Transition::Complete.allowed_from().contains(&JobStatus::Pending));
        assert!(Transition::Pause.is_noop_for(JobStatus::Paused));
        assert!(!Transition::Resume.is_noop_for(JobStatus::Pending));
        assert!(Transition::Cancel.allowed_from().contains(&JobStatus::Paused));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new(TargetId::new(), 0);
        let now = Utc::now();
        job.mark_running("w1", now);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress_message.as_deref(), Some("Starting..."));

        job.apply(Transition::Pause, now);
        job.apply(Transition::Resume, now);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none());

        job.mark_running("w2", now);
        job.apply(Transition::Complete, now);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100.0);
        assert!(job.completed_at.is_some());
    }
}
