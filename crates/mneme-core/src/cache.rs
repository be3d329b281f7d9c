//! Cache tier
//!
//! A keyed, TTL-bearing volatile store. Every `put` resets the expiry window
//! to `now + ttl` and returns the stored record so the caller can react to
//! the new `expires_at`. A record past its expiry is reported as absent even
//! if the backing store has not evicted it yet.
//!
//! Backends:
//! - [`MemoryCacheStore`]: in-process map with lazy expiry
//! - [`RedisCacheStore`]: Redis with server-side expiry

mod memory_store;
mod redis_store;

pub use memory_store::MemoryCacheStore;
pub use redis_store::RedisCacheStore;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::thread::{CacheRecord, Thread};
use async_trait::async_trait;
use std::time::Duration;

/// Cache store trait for abstracting volatile backends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a live record; expired records are `None`
    ///
    /// # Errors
    ///
    /// [`Error::StoreUnavailable`] when the backend cannot be reached, which
    /// is distinct from `Ok(None)`.
    async fn get(&self, thread_id: &str) -> Result<Option<CacheRecord>>;

    /// Store a thread under its id with expiry `now + ttl`
    async fn put(&self, thread: &Thread, ttl: Duration) -> Result<CacheRecord>;

    /// Delete a record, returning whether one existed
    async fn delete(&self, thread_id: &str) -> Result<bool>;

    /// Ids of all live records
    async fn list_ids(&self) -> Result<Vec<String>>;
}

/// Cache backend selected by configuration
pub enum CacheBackend {
    /// In-process storage
    Memory(MemoryCacheStore),
    /// Redis storage
    Redis(RedisCacheStore),
}

impl CacheBackend {
    /// Create a cache backend from configuration
    ///
    /// # Errors
    ///
    /// Returns error for an unknown backend or an invalid Redis URL.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        match config.backend.as_str() {
            "memory" => Ok(Self::Memory(MemoryCacheStore::new())),
            "redis" => {
                let url = config.redis_url.as_deref().unwrap_or("redis://localhost:6379");
                Ok(Self::Redis(RedisCacheStore::with_prefix(url, &config.prefix)?))
            }
            other => Err(Error::InvalidConfig {
                field: "cache.backend".to_string(),
                message: format!("unknown backend '{}'. Use 'memory' or 'redis'.", other),
            }),
        }
    }
}

#[async_trait]
impl CacheStore for CacheBackend {
    async fn get(&self, thread_id: &str) -> Result<Option<CacheRecord>> {
        match self {
            Self::Memory(store) => store.get(thread_id).await,
            Self::Redis(store) => store.get(thread_id).await,
        }
    }

    async fn put(&self, thread: &Thread, ttl: Duration) -> Result<CacheRecord> {
        match self {
            Self::Memory(store) => store.put(thread, ttl).await,
            Self::Redis(store) => store.put(thread, ttl).await,
        }
    }

    async fn delete(&self, thread_id: &str) -> Result<bool> {
        match self {
            Self::Memory(store) => store.delete(thread_id).await,
            Self::Redis(store) => store.delete(thread_id).await,
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        match self {
            Self::Memory(store) => store.list_ids().await,
            Self::Redis(store) => store.list_ids().await,
        }
    }
}
