//! Write-back scheduler
//!
//! Guarantees that a mutated thread reaches the archive before its cache
//! entry expires, without writing through on every turn. Each active thread
//! gets its own timer task that fires at `expires_at - safety_margin`; every
//! cache refresh cancels that task and issues a new one.
//!
//! When the write-back keeps failing it is retried with backoff until the
//! cache entry's expiry. Running out of time is a data-loss condition and is
//! logged as an operational alarm (`alarm = "durability_lag_exceeded"`).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::utils::{retry_until, RetryConfig, RetryError};

/// What a single write-back attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBackOutcome {
    /// Reconciled thread was written; carries the archived `merge_count`
    Archived(u64),
    /// Neither tier held the thread
    Nothing,
    /// The timer was cancelled before the attempt started
    Cancelled,
}

/// Future type for a write-back attempt
pub type WriteBackFuture = Pin<Box<dyn Future<Output = Result<WriteBackOutcome>> + Send>>;

/// Callback performing one write-back attempt for a thread id
pub type WriteBackFn = Arc<dyn Fn(String) -> WriteBackFuture + Send + Sync>;

struct PendingWriteBack {
    generation: u64,
    token: CancellationToken,
    fire_at: DateTime<Utc>,
}

struct SchedulerInner {
    safety_margin: Duration,
    retry: RetryConfig,
    write_back: WriteBackFn,
    timers: DashMap<String, PendingWriteBack>,
    next_generation: AtomicU64,
    alarms: AtomicU64,
    completed: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Per-thread write-back timers
pub struct WriteBackScheduler {
    inner: Arc<SchedulerInner>,
}

impl WriteBackScheduler {
    /// Create a scheduler that calls `write_back` for due threads
    pub fn new(safety_margin: Duration, retry: RetryConfig, write_back: WriteBackFn) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                safety_margin,
                retry,
                write_back,
                timers: DashMap::new(),
                next_generation: AtomicU64::new(1),
                alarms: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// (Re)schedule the write-back of `thread_id` for a cache entry expiring
    /// at `expires_at`, cancelling any pending timer for that id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, thread_id: &str, expires_at: DateTime<Utc>) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            debug!(thread_id = %thread_id, "Scheduler stopped, not scheduling write-back");
            return;
        }

        let until_expiry = (expires_at - Utc::now()).to_std().unwrap_or_default();
        let fire_in = until_expiry.saturating_sub(inner.safety_margin);
        // A margin beyond chrono's range fires at once, matching `fire_in`
        let fire_at = chrono::Duration::from_std(inner.safety_margin)
            .ok()
            .and_then(|margin| expires_at.checked_sub_signed(margin))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let deadline = Instant::now() + until_expiry;

        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = inner.shutdown.child_token();
        let previous = inner.timers.insert(
            thread_id.to_string(),
            PendingWriteBack {
                generation,
                token: token.clone(),
                fire_at,
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        debug!(
            thread_id = %thread_id,
            fire_in_ms = fire_in.as_millis() as u64,
            expires_at = %expires_at,
            "Write-back scheduled"
        );

        let task_inner = Arc::clone(inner);
        let thread_id = thread_id.to_string();
        inner.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(thread_id = %thread_id, "Pending write-back cancelled");
                    return;
                }
                _ = tokio::time::sleep(fire_in) => {}
            }

            task_inner
                .run_until_deadline(&thread_id, &token, deadline)
                .await;
            task_inner
                .timers
                .remove_if(&thread_id, |_, pending| pending.generation == generation);
        });
    }

    /// Cancel the pending write-back of `thread_id`, if any
    pub fn cancel(&self, thread_id: &str) -> bool {
        match self.inner.timers.remove(thread_id) {
            Some((_, pending)) => {
                pending.token.cancel();
                debug!(thread_id = %thread_id, "Write-back timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a write-back is pending for `thread_id`
    #[must_use]
    pub fn is_scheduled(&self, thread_id: &str) -> bool {
        self.inner.timers.contains_key(thread_id)
    }

    /// When the pending write-back of `thread_id` fires
    #[must_use]
    pub fn fire_at(&self, thread_id: &str) -> Option<DateTime<Utc>> {
        self.inner.timers.get(thread_id).map(|p| p.fire_at)
    }

    /// Ids with a pending write-back
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.inner.timers.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of durability alarms raised so far
    #[must_use]
    pub fn alarm_count(&self) -> u64 {
        self.inner.alarms.load(Ordering::SeqCst)
    }

    /// Number of scheduled write-backs that completed successfully
    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Cancel every timer and wait for running tasks to finish
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.timers.clear();
        inner.tracker.close();
        inner.tracker.wait().await;
        info!("Write-back scheduler stopped");
    }
}

impl SchedulerInner {
    async fn run_until_deadline(&self, thread_id: &str, token: &CancellationToken, deadline: Instant) {
        let attempt = || {
            let write_back = Arc::clone(&self.write_back);
            let token = token.clone();
            let thread_id = thread_id.to_string();
            async move {
                if token.is_cancelled() {
                    return Ok(WriteBackOutcome::Cancelled);
                }
                write_back(thread_id).await
            }
        };

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = retry_until(deadline, &self.retry, attempt, Error::is_retryable) => result,
        };

        match result {
            Ok(WriteBackOutcome::Archived(merge_count)) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                info!(thread_id = %thread_id, merge_count = merge_count, "Scheduled write-back archived thread");
            }
            Ok(WriteBackOutcome::Nothing) => {
                debug!(thread_id = %thread_id, "Scheduled write-back found nothing to archive");
            }
            Ok(WriteBackOutcome::Cancelled) => {
                debug!(thread_id = %thread_id, "Scheduled write-back superseded");
            }
            Err(RetryError { last_error, attempts }) if last_error.is_retryable() => {
                self.alarms.fetch_add(1, Ordering::SeqCst);
                let alarm = Error::DurabilityLagExceeded {
                    thread_id: thread_id.to_string(),
                    attempts,
                };
                error!(
                    alarm = "durability_lag_exceeded",
                    thread_id = %thread_id,
                    attempts = attempts,
                    last_error = %last_error,
                    "{}; latest turns are not durable",
                    alarm
                );
            }
            Err(RetryError { last_error, attempts }) => {
                warn!(
                    thread_id = %thread_id,
                    attempts = attempts,
                    error = %last_error,
                    "Scheduled write-back failed"
                );
            }
        }
    }
}
