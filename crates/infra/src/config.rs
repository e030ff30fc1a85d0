//! Process configuration.
//!
//! Loaded from an optional TOML file, then overridden by `GEOSCAN_*`
//! environment variables. Every field has a default, so an empty file (or
//! no file) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use geoscan_ai::{LearnerConfig, MismatchThresholds};

use crate::event_store::EventStoreConfig;

pub const ENV_DATA_DIR: &str = "GEOSCAN_DATA_DIR";
pub const ENV_LOG_FORMAT: &str = "GEOSCAN_LOG_FORMAT";
pub const ENV_WORKERS: &str = "GEOSCAN_WORKERS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl StorageConfig {
    /// Job queue and target registry.
    pub fn state_db(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn events_db(&self) -> PathBuf {
        self.data_dir.join("events.db")
    }

    pub fn archive_path(&self) -> PathBuf {
        self.data_dir.join("archive.jsonl")
    }

    pub fn model_path(&self) -> PathBuf {
        self.data_dir.join("model.json")
    }

    pub fn heartbeat_dir(&self) -> PathBuf {
        self.data_dir.join("heartbeat")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker threads started by `geoscan run`.
    pub count: usize,
    pub poll_interval_ms: u64,
    /// Running jobs older than this are reclaimed at startup.
    pub stale_after_secs: u64,
    pub max_failed_cycles: u32,
    /// Granularity of interruptible sleeps.
    pub sleep_slice_ms: u64,
    pub heartbeat: bool,
    /// Fixed RNG seed for candidate points; random when unset.
    pub seed: Option<u64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 1,
            poll_interval_ms: 2000,
            stale_after_secs: 24 * 60 * 60,
            max_failed_cycles: 3,
            sleep_slice_ms: 100,
            heartbeat: true,
            seed: None,
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sleep_slice(&self) -> Duration {
        Duration::from_millis(self.sleep_slice_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `pretty` or `json`.
    pub format: String,
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoscanConfig {
    pub storage: StorageConfig,
    pub worker: WorkerSettings,
    pub events: EventStoreConfig,
    pub learner: LearnerConfig,
    pub mismatch: MismatchThresholds,
    pub logging: LoggingConfig,
}

impl GeoscanConfig {
    /// Parse a TOML document.
    pub fn from_toml(s: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&s, path)
    }

    /// File (if any) plus process environment, validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `GEOSCAN_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT).filter(|v| !v.is_empty()) {
            self.logging.format = format;
        }
        if let Some(workers) = lookup(ENV_WORKERS).filter(|v| !v.is_empty()) {
            self.worker.count = workers
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{ENV_WORKERS} must be a positive integer, got {workers:?}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.worker.count == 0 {
            return invalid("worker.count must be at least 1");
        }
        if self.worker.sleep_slice_ms == 0 {
            return invalid("worker.sleep_slice_ms must be positive");
        }
        if self.worker.max_failed_cycles == 0 {
            return invalid("worker.max_failed_cycles must be at least 1");
        }
        if self.events.max_events == 0 {
            return invalid("events.max_events must be at least 1");
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }
}
