//! Archival tier
//!
//! A keyed, durable store with no expiry. `put` is idempotent (writing an
//! identical thread twice leaves the stored record untouched) and refuses to
//! move `merge_count` backwards, which would mean two writers raced on the
//! same thread.
//!
//! Backends:
//! - [`SqliteArchivalStore`]: default, production-ready
//! - [`MemoryArchivalStore`]: development and testing

mod memory_store;
mod sqlite_store;

pub use memory_store::MemoryArchivalStore;
pub use sqlite_store::SqliteArchivalStore;

use crate::config::{is_production, ArchiveConfig};
use crate::error::{Error, Result};
use crate::thread::{ArchivalRecord, Thread};
use async_trait::async_trait;

/// Archival store trait for abstracting durable backends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchivalStore: Send + Sync {
    /// Get the durable record of a thread
    async fn get(&self, thread_id: &str) -> Result<Option<ArchivalRecord>>;

    /// Store a thread under its id
    ///
    /// # Errors
    ///
    /// [`Error::WriteConflict`] if the stored `merge_count` is higher than
    /// the incoming one; [`Error::StoreUnavailable`] on outages.
    async fn put(&self, thread: &Thread) -> Result<ArchivalRecord>;

    /// Delete a record, returning whether one existed
    async fn delete(&self, thread_id: &str) -> Result<bool>;

    /// Ids of all archived threads
    async fn list_ids(&self) -> Result<Vec<String>>;
}

/// Shared `put` precondition for all backends.
///
/// Returns `Ok(true)` when the write can be skipped because the stored thread
/// is identical.
fn check_overwrite(stored: Option<&Thread>, incoming: &Thread) -> Result<bool> {
    let Some(stored) = stored else {
        return Ok(false);
    };
    if stored.merge_count > incoming.merge_count {
        return Err(Error::WriteConflict {
            thread_id: incoming.id.clone(),
            message: format!(
                "merge_count would regress from {} to {}",
                stored.merge_count, incoming.merge_count
            ),
        });
    }
    Ok(stored == incoming)
}

/// Archive backend selected by configuration
pub enum ArchiveBackend {
    /// SQLite storage (default)
    Sqlite(SqliteArchivalStore),
    /// In-memory storage (for testing only)
    Memory(MemoryArchivalStore),
}

impl ArchiveBackend {
    /// Create an archive backend from configuration
    ///
    /// # Errors
    ///
    /// Returns error for an unknown backend, a memory backend in production,
    /// or a database that cannot be opened.
    pub async fn from_config(config: &ArchiveConfig) -> Result<Self> {
        match config.backend.as_str() {
            "sqlite" => {
                let path = config.resolved_sqlite_path()?;
                Ok(Self::Sqlite(SqliteArchivalStore::new(&path).await?))
            }
            "memory" if is_production() => Err(Error::InvalidConfig {
                field: "archive.backend".to_string(),
                message: "memory archive is not allowed in production".to_string(),
            }),
            "memory" => Ok(Self::Memory(MemoryArchivalStore::new())),
            other => Err(Error::InvalidConfig {
                field: "archive.backend".to_string(),
                message: format!("unknown backend '{}'. Use 'sqlite' or 'memory'.", other),
            }),
        }
    }
}

#[async_trait]
impl ArchivalStore for ArchiveBackend {
    async fn get(&self, thread_id: &str) -> Result<Option<ArchivalRecord>> {
        match self {
            Self::Sqlite(store) => store.get(thread_id).await,
            Self::Memory(store) => store.get(thread_id).await,
        }
    }

    async fn put(&self, thread: &Thread) -> Result<ArchivalRecord> {
        match self {
            Self::Sqlite(store) => store.put(thread).await,
            Self::Memory(store) => store.put(thread).await,
        }
    }

    async fn delete(&self, thread_id: &str) -> Result<bool> {
        match self {
            Self::Sqlite(store) => store.delete(thread_id).await,
            Self::Memory(store) => store.delete(thread_id).await,
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        match self {
            Self::Sqlite(store) => store.list_ids().await,
            Self::Memory(store) => store.list_ids().await,
        }
    }
}

#[cfg(test)]
mod tests;
