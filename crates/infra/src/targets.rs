//! Target registry.
//!
//! Targets are stored whole as JSON; `name` and `status` are duplicated
//! into columns for listing. The SQLite store shares the state database
//! with the job queue so deleting a target removes its jobs in the same
//! transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use sqlx::Row;
use thiserror::Error;

use geoscan_core::{Target, TargetId};

use crate::db::{Database, DatabaseError, STATE_SCHEMA, describe_sqlx_error, to_millis};

#[derive(Debug, Error)]
pub enum TargetStoreError {
    #[error("target storage error: {0}")]
    Storage(String),

    #[error("failed to encode or decode target {id}: {source}")]
    Serde {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

pub trait TargetStore: Send + Sync {
    fn get(&self, id: TargetId) -> Result<Option<Target>, TargetStoreError>;

    /// Insert or replace.
    fn save(&self, target: &Target) -> Result<(), TargetStoreError>;

    /// Remove the target and every job that scans it. Returns whether it existed.
    fn delete(&self, id: TargetId) -> Result<bool, TargetStoreError>;

    /// Oldest first.
    fn list(&self) -> Result<Vec<Target>, TargetStoreError>;
}

impl<S> TargetStore for Arc<S>
where
    S: TargetStore + ?Sized,
{
    fn get(&self, id: TargetId) -> Result<Option<Target>, TargetStoreError> {
        (**self).get(id)
    }

    fn save(&self, target: &Target) -> Result<(), TargetStoreError> {
        (**self).save(target)
    }

    fn delete(&self, id: TargetId) -> Result<bool, TargetStoreError> {
        (**self).delete(id)
    }

    fn list(&self) -> Result<Vec<Target>, TargetStoreError> {
        (**self).list()
    }
}

/// In-memory target store.
///
/// Intended for tests/dev. Knows nothing about jobs.
#[derive(Debug, Default)]
pub struct InMemoryTargetStore {
    targets: RwLock<HashMap<TargetId, Target>>,
}

impl InMemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> TargetStoreError {
    TargetStoreError::Storage("lock poisoned".to_string())
}

impl TargetStore for InMemoryTargetStore {
    fn get(&self, id: TargetId) -> Result<Option<Target>, TargetStoreError> {
        Ok(self.targets.read().map_err(|_| poisoned())?.get(&id).cloned())
    }

    fn save(&self, target: &Target) -> Result<(), TargetStoreError> {
        self.targets
            .write()
            .map_err(|_| poisoned())?
            .insert(target.id, target.clone());
        Ok(())
    }

    fn delete(&self, id: TargetId) -> Result<bool, TargetStoreError> {
        Ok(self.targets.write().map_err(|_| poisoned())?.remove(&id).is_some())
    }

    fn list(&self) -> Result<Vec<Target>, TargetStoreError> {
        let mut all: Vec<Target> = self.targets.read().map_err(|_| poisoned())?.values().cloned().collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        Ok(all)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteTargetStore {
    db: Database,
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TargetStoreError {
    TargetStoreError::Storage(describe_sqlx_error(operation, err))
}

fn decode(id: String, body: &str) -> Result<Target, TargetStoreError> {
    serde_json::from_str(body).map_err(|source| TargetStoreError::Serde { id, source })
}

impl SqliteTargetStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        Ok(Self::new(Database::open(path, &STATE_SCHEMA)?))
    }
}

impl TargetStore for SqliteTargetStore {
    fn get(&self, id: TargetId) -> Result<Option<Target>, TargetStoreError> {
        let body: Option<String> = self
            .db
            .block_on(
                sqlx::query_scalar("SELECT body FROM targets WHERE id = ?1")
                    .bind(id.to_string())
                    .fetch_optional(self.db.pool()),
            )
            .map_err(|e| map_sqlx_error("get_target", e))?;
        body.map(|b| decode(id.to_string(), &b)).transpose()
    }

    fn save(&self, target: &Target) -> Result<(), TargetStoreError> {
        let body = serde_json::to_string(target).map_err(|source| TargetStoreError::Serde {
            id: target.id.to_string(),
            source,
        })?;
        self.db
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO targets (id, name, status, body, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        status = excluded.status,
                        body = excluded.body,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(target.id.to_string())
                .bind(&target.name)
                .bind(target.status.as_str())
                .bind(body)
                .bind(to_millis(Utc::now()))
                .execute(self.db.pool()),
            )
            .map_err(|e| map_sqlx_error("save_target", e))?;
        Ok(())
    }

    fn delete(&self, id: TargetId) -> Result<bool, TargetStoreError> {
        self.db
            .block_on(async {
                let mut tx = self.db.pool().begin().await?;
                sqlx::query("DELETE FROM jobs WHERE target_id = ?1")
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?;
                let done = sqlx::query("DELETE FROM targets WHERE id = ?1")
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(done.rows_affected() > 0)
            })
            .map_err(|e| map_sqlx_error("delete_target", e))
    }

    fn list(&self) -> Result<Vec<Target>, TargetStoreError> {
        let rows = self
            .db
            .block_on(sqlx::query("SELECT id, body FROM targets").fetch_all(self.db.pool()))
            .map_err(|e| map_sqlx_error("list_targets", e))?;

        let mut all = rows
            .iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(|e| map_sqlx_error("list_targets", e))?;
                let body: String = row.try_get("body").map_err(|e| map_sqlx_error("list_targets", e))?;
                decode(id, &body)
            })
            .collect::<Result<Vec<_>, _>>()?;
        all.sort_by_key(|t| (t.created_at, t.id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use geoscan_core::{BoundingBox, Position, TargetSettings, TargetStatus};

    use super::*;
    use crate::jobs::{JobQueue, SqliteJobQueue};

    fn target(name: &str) -> Target {
        let bounds = BoundingBox::from_center(Position::new(37.77, -122.42), 2.0).unwrap();
        Target::new(name, bounds, TargetSettings::default()).unwrap()
    }

    fn exercise(store: &dyn TargetStore) {
        let mut a = target("harbor");
        let b = target("ridge");
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        a.record_points(42);
        a.set_status(TargetStatus::Scanning);
        store.save(&a).unwrap();

        let loaded = store.get(a.id).unwrap().unwrap();
        assert_eq!(loaded.points_collected, 42);
        assert_eq!(loaded.status, TargetStatus::Scanning);
        assert_eq!(store.list().unwrap().len(), 2);

        assert!(store.delete(b.id).unwrap());
        assert!(!store.delete(b.id).unwrap());
        assert!(store.get(b.id).unwrap().is_none());
    }

    #[test]
    fn in_memory_store() {
        exercise(&InMemoryTargetStore::new());
    }

    #[test]
    fn sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&SqliteTargetStore::open(dir.path().join("state.db")).unwrap());
    }

    #[test]
    fn deleting_target_deletes_its_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("state.db"), &STATE_SCHEMA).unwrap();
        let store = SqliteTargetStore::new(db.clone());
        let queue = SqliteJobQueue::new(db);

        let t = target("delta");
        store.save(&t).unwrap();
        queue.enqueue(t.id, 0).unwrap();
        queue.enqueue(t.id, 1).unwrap();
        let other = queue.enqueue(TargetId::new(), 0).unwrap();

        assert!(store.delete(t.id).unwrap());
        assert!(queue.jobs_for_target(t.id).unwrap().is_empty());
        assert!(queue.get(other).unwrap().is_some());
    }
}
