//! Session coordinator
//!
//! Decides where a thread currently lives and keeps the two tiers in step:
//!
//! ```text
//! LOOKUP ──hit──▶ HIT_CACHE ───────────────────────────────▶ RESOLVED
//!    │
//!   miss ─▶ LOOKUP_ARCHIVE ──hit──▶ HIT_ARCHIVE (rehydrate) ▶ RESOLVED
//!                 │
//!                miss ─▶ MISS_ARCHIVE (create) ─────────────▶ RESOLVED
//! ```
//!
//! Every operation on a thread id runs under that id's lock, so at most one
//! mutation, write-back or delete is in flight per id. Operations on
//! different ids never contend.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchivalStore, ArchiveBackend};
use crate::cache::{CacheBackend, CacheStore};
use crate::config::MemoryConfig;
use crate::error::{Error, Result, StoreKind};
use crate::merge::reconcile;
use crate::scheduler::{WriteBackFn, WriteBackFuture, WriteBackOutcome, WriteBackScheduler};
use crate::thread::{ArchivalRecord, CacheRecord, Message, Thread, ThreadLocation, ThreadSummary};
use crate::utils::{retry_with_backoff, RetryConfig};

/// Which tiers `list_threads` draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListSource {
    /// Active sessions, then cache, then archive
    #[default]
    All,
    /// Cache tier only
    Cache,
    /// Archival tier only
    Archive,
}

/// Bookkeeping for a thread handled by this process
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Thread id
    pub thread_id: String,
    /// Thread creation time
    pub created_at: DateTime<Utc>,
    /// Last time this process touched the thread
    pub last_accessed_at: DateTime<Utc>,
    /// Number of messages in the latest state
    pub message_count: usize,
    /// Whether the latest state is known to be archived
    pub persisted: bool,
    /// Current cache expiry; `None` while the cache tier is bypassed
    pub expires_at: Option<DateTime<Utc>>,
}

enum Lookup {
    Cached(CacheRecord),
    Archived(Thread),
    Missing,
}

/// State shared with the write-back scheduler
struct CoordinatorCore {
    cache: Arc<dyn CacheStore>,
    archive: Arc<dyn ArchivalStore>,
    ttl: Duration,
    retry: RetryConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    sessions: DashMap<String, SessionInfo>,
}

impl CoordinatorCore {
    fn lock_for(&self, thread_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry unless someone else still holds or awaits it
    fn release_lock(&self, thread_id: &str) {
        self.locks
            .remove_if(thread_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn track(&self, thread: &Thread, expires_at: Option<DateTime<Utc>>, persisted: bool) {
        self.sessions.insert(
            thread.id.clone(),
            SessionInfo {
                thread_id: thread.id.clone(),
                created_at: thread.created_at,
                last_accessed_at: Utc::now(),
                message_count: thread.message_count(),
                persisted,
                expires_at,
            },
        );
    }

    /// One write-back attempt; caller holds the id lock
    async fn write_back_locked(&self, thread_id: &str) -> Result<Option<ArchivalRecord>> {
        let cached = self.cache.get(thread_id).await?.map(|record| record.thread);
        let archived = self.archive.get(thread_id).await?.map(|record| record.thread);

        let Some(merged) = reconcile(cached.as_ref(), archived.as_ref())? else {
            debug!(thread_id = %thread_id, "Nothing to write back");
            self.sessions.remove(thread_id);
            return Ok(None);
        };

        let record = self.archive.put(&merged).await?;
        if cached.is_some() {
            if let Some(mut session) = self.sessions.get_mut(thread_id) {
                session.persisted = true;
            }
        } else {
            // Cache entry is gone, so the session is no longer active here
            self.sessions.remove(thread_id);
        }

        debug!(
            thread_id = %thread_id,
            merge_count = record.thread.merge_count,
            messages = record.thread.message_count(),
            "Thread written back"
        );
        Ok(Some(record))
    }

    /// Drop the lock entry of a thread that is no longer tracked
    fn release_if_untracked(&self, thread_id: &str) {
        if !self.sessions.contains_key(thread_id) {
            self.release_lock(thread_id);
        }
    }

    /// Forget sessions whose cache entry has expired, along with their locks
    fn prune_expired(&self) {
        let now = Utc::now();
        let expired = |session: &SessionInfo| session.expires_at.is_some_and(|at| at <= now);

        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove_if(&id, |_, s| expired(s)) {
                debug!(thread_id = %id, persisted = session.persisted, "Session expired");
                self.release_lock(&id);
            }
        }
    }

    /// One locked write-back attempt, as run by the scheduler
    async fn write_back_once(&self, thread_id: &str) -> Result<WriteBackOutcome> {
        let lock = self.lock_for(thread_id);
        let result = {
            let _guard = lock.lock().await;
            self.write_back_locked(thread_id).await
        };
        drop(lock);
        self.release_if_untracked(thread_id);
        self.prune_expired();

        Ok(match result? {
            Some(record) => WriteBackOutcome::Archived(record.thread.merge_count),
            None => WriteBackOutcome::Nothing,
        })
    }

    /// Durable write used when the cache tier cannot take a mutation
    async fn write_through(&self, thread: &Thread) -> Result<ArchivalRecord> {
        retry_with_backoff(
            &self.retry,
            || async move {
                let archived = self.archive.get(&thread.id).await?.map(|r| r.thread);
                let merged = reconcile(Some(thread), archived.as_ref())?
                    .unwrap_or_else(|| thread.clone());
                self.archive.put(&merged).await
            },
            Error::is_retryable,
        )
        .await
        .map_err(|e| e.last_error)
    }
}

/// Orchestrates restore-or-create, mutation, write-back and deletion
pub struct SessionCoordinator {
    core: Arc<CoordinatorCore>,
    scheduler: WriteBackScheduler,
}

impl SessionCoordinator {
    /// Build a coordinator over explicit stores
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the timing settings are inconsistent.
    pub fn new(
        cache: Arc<dyn CacheStore>,
        archive: Arc<dyn ArchivalStore>,
        config: &MemoryConfig,
    ) -> Result<Self> {
        // Backend restrictions are enforced by `from_config`
        config.validate_for(false)?;

        let core = Arc::new(CoordinatorCore {
            cache,
            archive,
            ttl: config.cache.ttl(),
            retry: config.write_back.retry(),
            locks: DashMap::new(),
            sessions: DashMap::new(),
        });

        let write_back_core = Arc::clone(&core);
        let write_back: WriteBackFn = Arc::new(move |thread_id: String| {
            let core = Arc::clone(&write_back_core);
            Box::pin(async move { core.write_back_once(&thread_id).await }) as WriteBackFuture
        });
        let scheduler = WriteBackScheduler::new(
            config.write_back.safety_margin(),
            config.write_back.retry(),
            write_back,
        );

        Ok(Self { core, scheduler })
    }

    /// Build a coordinator with the backends named in `config`
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when a backend cannot be opened.
    pub async fn from_config(config: &MemoryConfig) -> Result<Self> {
        config.validate()?;
        let cache = CacheBackend::from_config(&config.cache)?;
        let archive = ArchiveBackend::from_config(&config.archive).await?;
        info!(
            cache = %config.cache.backend,
            archive = %config.archive.backend,
            ttl_secs = config.cache.ttl_secs,
            safety_margin_secs = config.write_back.safety_margin_secs,
            "Session coordinator initialized"
        );
        Self::new(Arc::new(cache), Arc::new(archive), config)
    }

    /// The write-back scheduler driving this coordinator
    #[must_use]
    pub fn scheduler(&self) -> &WriteBackScheduler {
        &self.scheduler
    }

    /// Resolve a thread by id, restoring it from the archive or creating it
    /// as needed. Without an id a fresh thread is created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] when the archive cannot be read
    /// after a cache miss; an unresolvable thread is never returned as empty.
    pub async fn resolve_or_create(&self, thread_id: Option<&str>) -> Result<Thread> {
        let Some(thread_id) = thread_id else {
            let thread = Thread::generate();
            let lock = self.core.lock_for(&thread.id);
            let _guard = lock.lock().await;
            self.store(&thread).await?;
            info!(thread_id = %thread.id, "New thread created");
            return Ok(thread);
        };

        let lock = self.core.lock_for(thread_id);
        let _guard = lock.lock().await;

        if let Some(thread) = self.resolve_locked(thread_id).await? {
            return Ok(thread);
        }
        let thread = Thread::new(thread_id);
        self.store(&thread).await?;
        info!(thread_id = %thread_id, "New thread created");
        Ok(thread)
    }

    /// Resolve a thread without creating it, rehydrating the cache on an
    /// archive hit
    ///
    /// # Errors
    ///
    /// Same as [`resolve_or_create`](Self::resolve_or_create).
    pub async fn resolve(&self, thread_id: &str) -> Result<Option<Thread>> {
        let lock = self.core.lock_for(thread_id);
        let _guard = lock.lock().await;
        self.resolve_locked(thread_id).await
    }

    async fn resolve_locked(&self, thread_id: &str) -> Result<Option<Thread>> {
        Ok(match self.lookup(thread_id).await? {
            Lookup::Cached(record) => {
                self.adopt(&record);
                Some(record.thread)
            }
            Lookup::Archived(thread) => {
                self.rehydrate(&thread).await;
                Some(thread)
            }
            Lookup::Missing => None,
        })
    }

    /// Append messages to a thread and refresh its cache entry
    ///
    /// An expired cache entry is restored from the archive first. When the
    /// cache cannot take the write, the thread is written through to the
    /// archive instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadNotFound`] when neither tier holds the thread.
    pub async fn mutate(&self, thread_id: &str, messages: Vec<Message>) -> Result<Thread> {
        let lock = self.core.lock_for(thread_id);
        let _guard = lock.lock().await;

        let mut thread = match self.lookup(thread_id).await? {
            Lookup::Cached(record) => record.thread,
            Lookup::Archived(thread) => {
                debug!(thread_id = %thread_id, "Restoring archived thread before mutation");
                thread
            }
            Lookup::Missing => return Err(Error::ThreadNotFound(thread_id.to_string())),
        };

        let added = messages.len();
        thread.append(messages);
        self.store(&thread).await?;
        debug!(
            thread_id = %thread_id,
            added = added,
            total = thread.message_count(),
            "Thread mutated"
        );
        Ok(thread)
    }

    /// Reconcile the cached and archived copies and archive the result,
    /// retrying with backoff. The cache entry is left in place.
    ///
    /// Returns `None` when neither tier holds the thread.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retry budget is spent, or
    /// [`Error::WriteConflict`] immediately.
    pub async fn write_back(&self, thread_id: &str) -> Result<Option<ArchivalRecord>> {
        let core = &self.core;
        let scheduler = &self.scheduler;
        let record = retry_with_backoff(
            &core.retry,
            || async move {
                let lock = core.lock_for(thread_id);
                let _guard = lock.lock().await;
                let result = core.write_back_locked(thread_id).await;
                if result.is_ok() {
                    // Archive matches the cache; a later mutation reschedules once it gets the lock
                    scheduler.cancel(thread_id);
                }
                result
            },
            Error::is_retryable,
        )
        .await
        .map_err(|e| {
            warn!(
                thread_id = %thread_id,
                attempts = e.attempts,
                error = %e.last_error,
                "Write-back failed"
            );
            e.last_error
        })?;

        core.release_if_untracked(thread_id);
        Ok(record)
    }

    /// Remove a thread from both tiers and cancel its pending write-back
    ///
    /// Returns whether either tier held the thread.
    ///
    /// # Errors
    ///
    /// Fails when either store cannot be reached; the delete can be repeated.
    pub async fn delete(&self, thread_id: &str) -> Result<bool> {
        let lock = self.core.lock_for(thread_id);
        let guard = lock.lock().await;

        self.scheduler.cancel(thread_id);
        let cached = self.core.cache.delete(thread_id).await?;
        let archived = self.core.archive.delete(thread_id).await?;
        self.core.sessions.remove(thread_id);

        drop(guard);
        drop(lock);
        self.core.release_lock(thread_id);

        info!(thread_id = %thread_id, cached = cached, archived = archived, "Thread deleted");
        Ok(cached || archived)
    }

    /// Ids of threads this process is tracking
    ///
    /// Sessions whose cache entry has expired are dropped first.
    #[must_use]
    pub fn list_active(&self) -> Vec<String> {
        self.core.prune_expired();
        let mut ids: Vec<String> = self
            .core
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Bookkeeping for a tracked thread
    #[must_use]
    pub fn session(&self, thread_id: &str) -> Option<SessionInfo> {
        self.core.sessions.get(thread_id).map(|s| s.clone())
    }

    /// Summaries of known threads, de-duplicated and capped at `limit`
    ///
    /// # Errors
    ///
    /// Fails when a tier named by `source` cannot be listed. With
    /// [`ListSource::All`] an unreachable cache is skipped.
    pub async fn list_threads(&self, source: ListSource, limit: usize) -> Result<Vec<ThreadSummary>> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut push = |id: String, location: ThreadLocation| {
            if seen.insert(id.clone()) {
                candidates.push((id, location));
            }
        };

        if source == ListSource::All {
            for id in self.list_active() {
                push(id, ThreadLocation::Active);
            }
        }
        if matches!(source, ListSource::All | ListSource::Cache) {
            match self.core.cache.list_ids().await {
                Ok(ids) => ids
                    .into_iter()
                    .for_each(|id| push(id, ThreadLocation::Cache)),
                Err(e) if source == ListSource::All && e.is_unavailable(StoreKind::Cache) => {
                    warn!(error = %e, "Cache unavailable, listing archive only");
                }
                Err(e) => return Err(e),
            }
        }
        if matches!(source, ListSource::All | ListSource::Archive) {
            for id in self.core.archive.list_ids().await? {
                push(id, ThreadLocation::Archive);
            }
        }

        candidates.truncate(limit);
        let summaries = join_all(
            candidates
                .iter()
                .map(|(id, location)| self.summarize(id, *location)),
        )
        .await;

        let mut out = Vec::with_capacity(summaries.len());
        for summary in summaries {
            if let Some(summary) = summary? {
                out.push(summary);
            }
        }
        Ok(out)
    }

    /// Stop the scheduler and archive every session with unpersisted turns
    ///
    /// Returns the number of sessions written back.
    ///
    /// # Errors
    ///
    /// Every session is attempted; the first failure is returned afterwards.
    pub async fn shutdown(&self) -> Result<usize> {
        self.scheduler.shutdown().await;

        let dirty: Vec<String> = self
            .core
            .sessions
            .iter()
            .filter(|entry| !entry.persisted)
            .map(|entry| entry.key().clone())
            .collect();
        info!(sessions = dirty.len(), "Flushing unpersisted sessions");

        let results = join_all(dirty.iter().map(|id| self.write_back(id))).await;

        let mut flushed = 0;
        let mut first_error = None;
        for (id, result) in dirty.iter().zip(results) {
            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    error!(thread_id = %id, error = %e, "Failed to flush session on shutdown");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(flushed = flushed, "Session coordinator stopped");
                Ok(flushed)
            }
        }
    }

    /// LOOKUP → LOOKUP_ARCHIVE; caller holds the id lock
    async fn lookup(&self, thread_id: &str) -> Result<Lookup> {
        match self.core.cache.get(thread_id).await {
            Ok(Some(record)) => {
                debug!(thread_id = %thread_id, "Cache hit");
                return Ok(Lookup::Cached(record));
            }
            Ok(None) => debug!(thread_id = %thread_id, "Cache miss"),
            Err(e) if e.is_unavailable(StoreKind::Cache) => {
                warn!(thread_id = %thread_id, error = %e, "Cache unavailable, falling back to archive");
            }
            Err(e) => return Err(e),
        }

        Ok(match self.core.archive.get(thread_id).await? {
            Some(record) => {
                debug!(thread_id = %thread_id, "Archive hit");
                Lookup::Archived(record.thread)
            }
            None => Lookup::Missing,
        })
    }

    /// Pick up a cache hit, scheduling a write-back if this process has none
    fn adopt(&self, record: &CacheRecord) {
        let thread_id = &record.thread.id;
        if !self.scheduler.is_scheduled(thread_id) {
            self.scheduler.schedule(thread_id, record.expires_at);
        }
        match self.core.sessions.get_mut(thread_id) {
            Some(mut session) => session.last_accessed_at = Utc::now(),
            None => self.core.track(&record.thread, Some(record.expires_at), false),
        }
    }

    /// Put an archived thread back into the cache
    async fn rehydrate(&self, thread: &Thread) {
        match self.core.cache.put(thread, self.core.ttl).await {
            Ok(record) => {
                self.scheduler.schedule(&thread.id, record.expires_at);
                self.core.track(thread, Some(record.expires_at), true);
                info!(
                    thread_id = %thread.id,
                    messages = thread.message_count(),
                    "Thread restored from archive"
                );
            }
            Err(e) => {
                // The archive copy is authoritative; serving it uncached loses nothing
                warn!(thread_id = %thread.id, error = %e, "Failed to rehydrate cache");
                self.core.track(thread, None, true);
            }
        }
    }

    /// Write the latest state to the cache, or through to the archive when
    /// the cache is down; caller holds the id lock
    async fn store(&self, thread: &Thread) -> Result<()> {
        match self.core.cache.put(thread, self.core.ttl).await {
            Ok(record) => {
                self.scheduler.schedule(&thread.id, record.expires_at);
                self.core.track(thread, Some(record.expires_at), false);
                Ok(())
            }
            Err(e) if e.is_unavailable(StoreKind::Cache) => {
                warn!(thread_id = %thread.id, error = %e, "Cache unavailable, writing through to archive");
                self.core.write_through(thread).await?;
                self.scheduler.cancel(&thread.id);
                self.core.track(thread, None, true);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn summarize(&self, thread_id: &str, location: ThreadLocation) -> Result<Option<ThreadSummary>> {
        if location != ThreadLocation::Archive {
            match self.core.cache.get(thread_id).await {
                Ok(Some(record)) => {
                    let mut summary = ThreadSummary::from_thread(&record.thread, location);
                    summary.expires_at = Some(record.expires_at);
                    summary.persisted = self
                        .core
                        .sessions
                        .get(thread_id)
                        .is_some_and(|s| s.persisted);
                    return Ok(Some(summary));
                }
                Ok(None) => {}
                Err(e) if e.is_unavailable(StoreKind::Cache) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(self
            .core
            .archive
            .get(thread_id)
            .await?
            .map(|record| ThreadSummary::from_thread(&record.thread, ThreadLocation::Archive)))
    }
}

#[cfg(test)]
mod tests;
