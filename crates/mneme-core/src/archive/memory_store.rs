use super::{check_overwrite, ArchivalStore};
use crate::error::{Error, Result};
use crate::thread::{ArchivalRecord, Thread};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, warn};

/// In-memory archival store (for development/testing)
///
/// Not durable: everything is lost on restart. Carries failure injection
/// ([`fail_next`](Self::fail_next), [`set_available`](Self::set_available))
/// for exercising outage handling.
#[derive(Default)]
pub struct MemoryArchivalStore {
    records: DashMap<String, ArchivalRecord>,
    pending_failures: AtomicU32,
    down: AtomicBool,
    writes: AtomicU64,
}

impl MemoryArchivalStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with `StoreUnavailable`
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Toggle a persistent outage
    pub fn set_available(&self, available: bool) {
        self.down.store(!available, Ordering::SeqCst);
    }

    /// Number of physical writes performed
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self, op: &str) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::archive_unavailable(format!("{} refused: store is down", op)));
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            warn!(op = op, "Injected archive failure");
            return Err(Error::archive_unavailable(format!("{} failed (injected)", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl ArchivalStore for MemoryArchivalStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ArchivalRecord>> {
        self.check_available("get")?;
        Ok(self.records.get(thread_id).map(|r| r.clone()))
    }

    async fn put(&self, thread: &Thread) -> Result<ArchivalRecord> {
        self.check_available("put")?;
        let record = match self.records.entry(thread.id.clone()) {
            Entry::Occupied(mut occupied) => {
                if check_overwrite(Some(&occupied.get().thread), thread)? {
                    debug!(thread_id = %thread.id, "Archive already up to date");
                    return Ok(occupied.get().clone());
                }
                let record = ArchivalRecord::new(thread.clone());
                occupied.insert(record.clone());
                record
            }
            Entry::Vacant(vacant) => {
                let record = ArchivalRecord::new(thread.clone());
                vacant.insert(record.clone());
                record
            }
        };

        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(thread_id = %thread.id, merge_count = thread.merge_count, "Thread archived in memory");
        Ok(record)
    }

    async fn delete(&self, thread_id: &str) -> Result<bool> {
        self.check_available("delete")?;
        Ok(self.records.remove(thread_id).is_some())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        self.check_available("list")?;
        Ok(self.records.iter().map(|e| e.key().clone()).collect())
    }
}
