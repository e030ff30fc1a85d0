//! Append-only JSONL archive of every scored sample.
//!
//! The event store keeps a bounded live window; this file is the full
//! history offline retraining reads. One record per line, written with a
//! single `write_all` under a mutex so lines from concurrent workers never
//! interleave.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use geoscan_ai::MismatchKind;
use geoscan_core::TargetId;

use crate::event_store::ScanEvent;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode archive record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("corrupt archive line {line} in {path}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

/// The rule engine's verdict: the training label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertLabel {
    pub score: f64,
    pub trace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub prediction: f64,
    pub error: f64,
    pub is_surprise: bool,
    pub mismatch_count: usize,
    pub mismatch_types: Vec<MismatchKind>,
}

/// One archive line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    pub location: Location,
    pub features: JsonValue,
    pub expert_label: ExpertLabel,
    pub ml_metadata: ModelMetadata,
}

impl ArchiveRecord {
    pub fn from_event(event: &ScanEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            target_id: event.target_id,
            location: Location {
                lat: event.position.lat,
                lon: event.position.lon,
            },
            features: event.features.clone(),
            expert_label: ExpertLabel {
                score: event.utility_score,
                trace: event.trace.clone(),
            },
            ml_metadata: ModelMetadata {
                prediction: event.predicted_score,
                error: event.absolute_error,
                is_surprise: event.is_surprise,
                mismatch_count: event.mismatches.count,
                mismatch_types: event.mismatches.kinds.clone(),
            },
        }
    }
}

#[derive(Debug)]
pub struct ArchiveLog {
    path: PathBuf,
    file: Mutex<File>,
    written: AtomicU64,
}

impl ArchiveLog {
    /// Open `path` for appending, creating it (and its directory) if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let path = path.into();
        let io_err = |source| ArchiveError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            written: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended through this handle.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn append(&self, record: &ArchiveRecord) -> Result<(), ArchiveError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)
            .and_then(|_| file.flush())
            .map_err(|source| ArchiveError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Read every record in an archive file. A missing file is empty.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ArchiveError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| ArchiveError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| ArchiveError::Corrupt {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Non-empty lines in an archive file. A missing file has none.
    pub fn line_count(path: impl AsRef<Path>) -> Result<usize, ArchiveError> {
        let path = path.as_ref();
        match File::open(path) {
            Ok(f) => {
                let mut n = 0;
                for line in BufReader::new(f).lines() {
                    let line = line.map_err(|source| ArchiveError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                    if !line.trim().is_empty() {
                        n += 1;
                    }
                }
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(ArchiveError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
