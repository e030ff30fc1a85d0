//! Worker liveness records.
//!
//! Each worker rewrites `<dir>/<worker_id>.heartbeat.json` after every
//! cycle. Writes go through a temp file and a rename so readers never see a
//! half-written record. Failures are logged at debug and otherwise ignored.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use geoscan_ai::LearningMetrics;
use geoscan_core::{JobId, TargetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Scanning,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub pid: u32,
    pub state: WorkerState,
    pub cycles: u64,
    pub uptime_secs: u64,
    pub points_processed: u64,
    pub points_failed: u64,
    pub high_value_total: u64,
    pub surprise_total: u64,
    pub jobs_completed: u64,
    pub current_job: Option<JobId>,
    pub current_target: Option<TargetId>,
    pub learner: Option<LearningMetrics>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatWriter {
    dir: PathBuf,
}

impl HeartbeatWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{worker_id}.heartbeat.json"))
    }

    /// Best-effort write; returns whether the record landed.
    pub fn write(&self, heartbeat: &Heartbeat) -> bool {
        match self.try_write(heartbeat) {
            Ok(()) => true,
            Err(e) => {
                debug!(worker = %heartbeat.worker_id, error = %e, "failed to write heartbeat");
                false
            }
        }
    }

    fn try_write(&self, heartbeat: &Heartbeat) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&heartbeat.worker_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(heartbeat)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)
    }

    pub fn read(&self, worker_id: &str) -> Option<Heartbeat> {
        let bytes = std::fs::read(self.path_for(worker_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Every readable heartbeat in the directory, by worker id.
    pub fn read_all(&self) -> Vec<Heartbeat> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut all: Vec<Heartbeat> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".heartbeat.json"))
            .filter_map(|e| std::fs::read(e.path()).ok())
            .filter_map(|bytes| serde_json::from_slice(&bytes).ok())
            .collect();
        all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(worker_id: &str) -> Heartbeat {
        Heartbeat {
            worker_id: worker_id.to_string(),
            pid: std::process::id(),
            state: WorkerState::Scanning,
            cycles: 3,
            uptime_secs: 12,
            points_processed: 150,
            points_failed: 0,
            high_value_total: 9,
            surprise_total: 2,
            jobs_completed: 0,
            current_job: Some(JobId::new()),
            current_target: None,
            learner: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let writer = HeartbeatWriter::new(dir.path().join("heartbeat"));
        assert!(writer.write(&beat("w-1")));
        assert!(writer.write(&beat("w-0")));

        let back = writer.read("w-1").unwrap();
        assert_eq!(back.cycles, 3);
        assert_eq!(back.state, WorkerState::Scanning);

        let all = writer.read_all();
        assert_eq!(all.iter().map(|h| h.worker_id.as_str()).collect::<Vec<_>>(), vec!["w-0", "w-1"]);
    }

    #[test]
    fn unwritable_directory_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let writer = HeartbeatWriter::new(blocker.join("nested"));
        assert!(!writer.write(&beat("w")));
        assert!(writer.read("w").is_none());
    }
}
