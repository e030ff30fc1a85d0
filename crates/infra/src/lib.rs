//! Infrastructure layer: storage, the job queue and the scan worker.
//!
//! Everything here is synchronous at the API boundary. SQLite access goes
//! through [`db::Database`], which drives `sqlx` on a private runtime.

pub mod archive;
pub mod config;
pub mod db;
pub mod event_store;
pub mod fetch;
pub mod heartbeat;
pub mod jobs;
pub mod targets;
pub mod worker;

pub use archive::{ArchiveError, ArchiveLog, ArchiveRecord};
pub use config::{ConfigError, GeoscanConfig};
pub use db::{Database, DatabaseError};
pub use event_store::{EventStore, EventStoreConfig, InMemoryEventStore, ScanEvent, SqliteEventStore};
pub use fetch::{FeatureFetcher, FetchError, OfflineFetcher};
pub use heartbeat::{Heartbeat, HeartbeatWriter, WorkerState};
pub use jobs::{InMemoryJobQueue, Job, JobQueue, JobQueueError, JobStatus, SqliteJobQueue};
pub use targets::{InMemoryTargetStore, SqliteTargetStore, TargetStore, TargetStoreError};
pub use worker::{ScanWorker, WorkerConfig, WorkerDeps, WorkerError, WorkerHandle, WorkerStats};
