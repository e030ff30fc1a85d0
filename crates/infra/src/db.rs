//! SQLite database handle shared by the durable stores.
//!
//! Stores expose a synchronous API (workers are plain OS threads), so each
//! [`Database`] owns a small tokio runtime used only to drive `sqlx` futures
//! via [`Database::block_on`]. Never call it from inside another runtime.
//!
//! ## Schema versions
//!
//! Each database file records its layout in `PRAGMA user_version`. On open,
//! a mismatching version drops and recreates the schema's tables (with a
//! warning) instead of reading rows in a layout the code does not expect.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("failed to start database runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to create database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open database {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("failed to prepare schema {schema} in {path}: {message}")]
    Schema {
        schema: &'static str,
        path: PathBuf,
        message: String,
    },
}

/// Tables owned by one database file, plus the version they were written at.
#[derive(Debug)]
pub struct Schema {
    pub name: &'static str,
    pub version: i64,
    /// Dropped (in order) when the stored version does not match.
    pub tables: &'static [&'static str],
    /// `CREATE ... IF NOT EXISTS` statements, run in order.
    pub statements: &'static [&'static str],
}

/// Work queue and target registry.
pub const STATE_SCHEMA: Schema = Schema {
    name: "state",
    version: 1,
    tables: &["jobs", "targets"],
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            seq              INTEGER PRIMARY KEY AUTOINCREMENT,
            id               TEXT NOT NULL UNIQUE,
            target_id        TEXT NOT NULL,
            status           TEXT NOT NULL,
            priority         INTEGER NOT NULL DEFAULT 0,
            created_at       INTEGER NOT NULL,
            started_at       INTEGER NULL,
            completed_at     INTEGER NULL,
            progress_percent REAL NOT NULL DEFAULT 0,
            progress_message TEXT NULL,
            error_message    TEXT NULL,
            worker_id        TEXT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (status, priority DESC, created_at, seq)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_target ON jobs (target_id)",
        r#"
        CREATE TABLE IF NOT EXISTS targets (
            id         TEXT PRIMARY KEY,
            name       TEXT NOT NULL,
            status     TEXT NOT NULL,
            body       TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ],
};

/// Scan event ring buffer and its per-minute aggregates.
pub const EVENTS_SCHEMA: Schema = Schema {
    name: "events",
    version: 1,
    tables: &["events", "event_buckets"],
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp        INTEGER NOT NULL,
            target_id        TEXT NULL,
            lat              REAL NOT NULL,
            lon              REAL NOT NULL,
            utility_score    REAL NOT NULL,
            predicted_score  REAL NOT NULL,
            absolute_error   REAL NOT NULL,
            is_surprise      INTEGER NOT NULL,
            is_high_value    INTEGER NOT NULL,
            mismatch_count   INTEGER NOT NULL,
            mismatch_kinds   TEXT NOT NULL,
            max_severity     REAL NOT NULL,
            slope_mismatch   INTEGER NOT NULL,
            zoning_mismatch  INTEGER NOT NULL,
            utility_mismatch INTEGER NOT NULL,
            flood_mismatch   INTEGER NOT NULL,
            features         TEXT NOT NULL,
            trace            TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp, id)",
        r#"
        CREATE TABLE IF NOT EXISTS event_buckets (
            minute           INTEGER PRIMARY KEY,
            event_count      INTEGER NOT NULL,
            high_value_count INTEGER NOT NULL,
            surprise_count   INTEGER NOT NULL,
            total_error      REAL NOT NULL,
            total_utility    REAL NOT NULL
        )
        "#,
    ],
};

/// Pool plus the runtime that drives it. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    runtime: Arc<Runtime>,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database at `path` and bring `schema`
    /// up to date.
    pub fn open(path: impl AsRef<Path>, schema: &Schema) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DatabaseError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("geoscan-db")
            .enable_all()
            .build()
            .map_err(DatabaseError::Runtime)?;

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = runtime
            .block_on(
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options),
            )
            .map_err(|e| DatabaseError::Open {
                path: path.clone(),
                message: e.to_string(),
            })?;

        let db = Self {
            pool,
            runtime: Arc::new(runtime),
            path,
        };
        db.prepare(schema)?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drive a future to completion on the database runtime.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    fn prepare(&self, schema: &Schema) -> Result<(), DatabaseError> {
        let schema_err = |e: sqlx::Error| DatabaseError::Schema {
            schema: schema.name,
            path: self.path.clone(),
            message: e.to_string(),
        };

        self.block_on(async {
            let mut tx = self.pool.begin().await?;

            let found: i64 = sqlx::query_scalar("PRAGMA user_version")
                .fetch_one(&mut *tx)
                .await?;

            if found != schema.version {
                if found != 0 {
                    warn!(
                        db = %self.path.display(),
                        schema = schema.name,
                        found,
                        expected = schema.version,
                        "schema version mismatch, recreating tables"
                    );
                }
                for table in schema.tables {
                    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                        .execute(&mut *tx)
                        .await?;
                }
            }

            for stmt in schema.statements {
                sqlx::query(stmt).execute(&mut *tx).await?;
            }

            if found != schema.version {
                sqlx::query(&format!("PRAGMA user_version = {}", schema.version))
                    .execute(&mut *tx)
                    .await?;
                info!(db = %self.path.display(), schema = schema.name, version = schema.version, "schema initialised");
            }

            tx.commit().await
        })
        .map_err(schema_err)
    }
}

/// Human-readable description of a sqlx failure, tagged with the operation.
pub(crate) fn describe_sqlx_error(operation: &str, err: sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            format!("database error in {operation} (code {code}): {}", db_err.message())
        }
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::PoolTimedOut => format!("timed out waiting for a connection in {operation}"),
        other => format!("{operation} failed: {other}"),
    }
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}
