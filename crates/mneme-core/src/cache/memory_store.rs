use super::CacheStore;
use crate::error::Result;
use crate::thread::{CacheRecord, Thread};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

/// In-process cache store
///
/// Expiry is lazy: an expired record is dropped the next time it is read,
/// or in bulk by [`MemoryCacheStore::purge_expired`].
#[derive(Default)]
pub struct MemoryCacheStore {
    records: DashMap<String, CacheRecord>,
}

impl MemoryCacheStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired record, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired cache records");
        }
        removed
    }

    /// Number of physically held records, expired ones included
    #[must_use]
    pub fn physical_len(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, thread_id: &str) -> Result<Option<CacheRecord>> {
        let now = Utc::now();
        match self.records.get(thread_id) {
            None => return Ok(None),
            Some(record) if !record.is_expired(now) => return Ok(Some(record.clone())),
            Some(_) => {}
        }
        self.records
            .remove_if(thread_id, |_, record| record.is_expired(now));
        debug!(thread_id = %thread_id, "Cache record expired");
        Ok(None)
    }

    async fn put(&self, thread: &Thread, ttl: Duration) -> Result<CacheRecord> {
        let record = CacheRecord::new(thread.clone(), ttl);
        self.records.insert(thread.id.clone(), record.clone());
        debug!(thread_id = %thread.id, expires_at = %record.expires_at, "Thread cached");
        Ok(record)
    }

    async fn delete(&self, thread_id: &str) -> Result<bool> {
        Ok(self.records.remove(thread_id).is_some())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        Ok(self
            .records
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect())
    }
}
