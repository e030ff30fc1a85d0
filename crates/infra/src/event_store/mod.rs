//! Bounded real-time store of scored samples.
//!
//! This is the live view: the newest `max_events` events plus per-minute
//! aggregates. Full history goes to the archive log instead.

pub mod in_memory;
pub mod sqlite;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use sqlite::SqliteEventStore;
pub use r#trait::{
    CurveBucket, EventStats, EventStore, EventStoreConfig, EventStoreError, MismatchHistogram,
    ScanEvent, StoredEvent, WindowRate,
};
