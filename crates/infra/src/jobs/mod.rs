//! Durable priority queue of scan jobs.
//!
//! ## Design
//!
//! - One job per scan of a target; higher priority first, then oldest first
//! - `claim_next` is a single conditional write, so concurrent workers (in
//!   one process or several) never claim the same job
//! - Terminal transitions are idempotent on terminal jobs; anything else out
//!   of order is an [`JobQueueError::InvalidTransition`]
//! - `reclaim_stale` puts jobs orphaned by a crashed worker back in line
//!
//! ## Components
//!
//! - `Job`, `JobStatus`, `Transition`: job record and its state machine
//! - `JobQueue`: queue boundary
//! - `InMemoryJobQueue`: tests/dev
//! - `SqliteJobQueue`: durable queue shared by every worker

pub mod queue;
pub mod sqlite;
pub mod types;

pub use queue::{InMemoryJobQueue, JobQueue, JobQueueError};
pub use sqlite::SqliteJobQueue;
pub use types::{Job, JobStats, JobStatus, RetryPolicy, Transition};
