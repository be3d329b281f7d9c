//! SQLite archival backend
//!
//! The default durable tier. One row per thread; the full thread is kept as
//! JSON next to the columns needed for listing and conflict checks.
//!
//! # Usage
//!
//! ```no_run
//! use mneme_core::archive::SqliteArchivalStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteArchivalStore::new("/path/to/threads.db").await?;
//! assert!(store.health_check().await?);
//! # Ok(())
//! # }
//! ```

use super::{check_overwrite, ArchivalStore};
use crate::error::{Error, Result};
use crate::thread::{ArchivalRecord, Thread};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// SQLite archival store
pub struct SqliteArchivalStore {
    pool: SqlitePool,
}

/// Map connection-level and lock-contention failures to `StoreUnavailable`,
/// the rest to `Internal`
fn classify(context: &str, e: sqlx::Error) -> Error {
    let transient = match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => is_busy(db.code().as_deref()),
        _ => false,
    };
    if transient {
        Error::archive_unavailable(format!("{}: {}", context, e))
    } else {
        Error::Internal(format!("{}: {}", context, e))
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
fn is_busy(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .is_some_and(|c| matches!(c & 0xff, 5 | 6))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid archived timestamp '{}': {}", raw, e)))
}

impl SqliteArchivalStore {
    /// Create a new SQLite store at the specified path
    ///
    /// # Errors
    ///
    /// Returns error if database creation or schema setup fails.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Internal(format!("Failed to create database directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| Error::Internal(format!("Invalid SQLite path: {}", e)))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| classify("Failed to connect to SQLite", e))?;

        let store = Self { pool };
        store.init_schema().await?;

        info!(path = %path.display(), "SQLite archival store initialized");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                thread_data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                merge_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| classify("Failed to create threads table", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_threads_updated_at ON threads(updated_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| classify("Failed to create index", e))?;

        debug!("SQLite archive schema initialized");
        Ok(())
    }

    /// Check database health
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the database cannot be queried.
    pub async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify("Health check failed", e))?;
        Ok(true)
    }

    /// Close the pool; later operations report `StoreUnavailable`
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ArchivalStore for SqliteArchivalStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ArchivalRecord>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT thread_data, updated_at FROM threads WHERE thread_id = ?")
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| classify("Failed to get thread", e))?;

        match row {
            Some((data, archived_at)) => {
                let thread: Thread = serde_json::from_str(&data)?;
                debug!(thread_id = %thread_id, "Thread loaded from SQLite");
                Ok(Some(ArchivalRecord {
                    thread,
                    archived_at: parse_timestamp(&archived_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, thread: &Thread) -> Result<ArchivalRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify("Failed to begin transaction", e))?;

        let existing: Option<(String, String)> =
            sqlx::query_as("SELECT thread_data, updated_at FROM threads WHERE thread_id = ?")
                .bind(&thread.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| classify("Failed to read thread", e))?;

        if let Some((data, archived_at)) = existing {
            let stored: Thread = serde_json::from_str(&data)?;
            if check_overwrite(Some(&stored), thread)? {
                debug!(thread_id = %thread.id, "Archive already up to date");
                return Ok(ArchivalRecord {
                    thread: stored,
                    archived_at: parse_timestamp(&archived_at)?,
                });
            }
        }

        let record = ArchivalRecord::new(thread.clone());
        let data = serde_json::to_string(thread)?;

        sqlx::query(
            r#"
            INSERT INTO threads (thread_id, thread_data, created_at, updated_at, merge_count)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(thread_id) DO UPDATE SET
                thread_data = excluded.thread_data,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                merge_count = excluded.merge_count
            "#,
        )
        .bind(&thread.id)
        .bind(&data)
        .bind(thread.created_at.to_rfc3339())
        .bind(record.archived_at.to_rfc3339())
        .bind(thread.merge_count as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify("Failed to save thread", e))?;

        tx.commit()
            .await
            .map_err(|e| classify("Failed to commit thread", e))?;

        debug!(thread_id = %thread.id, merge_count = thread.merge_count, "Thread archived in SQLite");
        Ok(record)
    }

    async fn delete(&self, thread_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM threads WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("Failed to delete thread", e))?;

        let deleted = result.rows_affected() > 0;
        debug!(thread_id = %thread_id, deleted = deleted, "Thread deleted from SQLite");
        Ok(deleted)
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT thread_id FROM threads ORDER BY updated_at DESC")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| classify("Failed to list threads", e))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
