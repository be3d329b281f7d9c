//! Cache/archive reconciliation
//!
//! Pure logic, no I/O. [`reconcile`] combines the cache-resident and
//! archive-resident versions of one thread into the version to persist.
//!
//! ## Positional merge assumption
//!
//! Messages are matched by position, not by content. The archive's sequence is
//! taken as the durable prefix and every cache message at an index beyond the
//! archive's length is appended after it ("new messages win"). This is only
//! correct while the cache holds a continuation of the archive's prefix, which
//! the per-thread lock in the coordinator guarantees. A cache copy that is
//! shorter than the archive contributes nothing; overlapping positions are
//! never compared.

use crate::error::{Error, Result};
use crate::thread::Thread;
use tracing::{debug, warn};

/// Reconcile the cache and archive versions of a thread.
///
/// - Neither side present: `Ok(None)`.
/// - One side present: that side, unchanged (including `merge_count`).
/// - Both present: archive messages plus the cache's positional suffix,
///   earliest `created_at`, latest `last_updated_at`, and
///   `merge_count = max(cache, archive) + 1`.
///
/// # Errors
///
/// Returns [`Error::WriteConflict`] if the two sides carry different ids.
pub fn reconcile(cache: Option<&Thread>, archive: Option<&Thread>) -> Result<Option<Thread>> {
    let (cache, archive) = match (cache, archive) {
        (None, None) => return Ok(None),
        (Some(only), None) | (None, Some(only)) => return Ok(Some(only.clone())),
        (Some(cache), Some(archive)) => (cache, archive),
    };

    if cache.id != archive.id {
        return Err(Error::WriteConflict {
            thread_id: archive.id.clone(),
            message: format!("cache holds thread '{}' under this id", cache.id),
        });
    }

    let durable = archive.messages.len();
    if cache.messages.len() < durable {
        warn!(
            thread_id = %archive.id,
            cache_msgs = cache.messages.len(),
            archive_msgs = durable,
            "Cache copy is shorter than the archive; keeping archive messages"
        );
    }

    let mut messages = archive.messages.clone();
    messages.extend(cache.messages.iter().skip(durable).cloned());

    let merged = Thread {
        id: archive.id.clone(),
        created_at: cache.created_at.min(archive.created_at),
        last_updated_at: cache.last_updated_at.max(archive.last_updated_at),
        merge_count: cache.merge_count.max(archive.merge_count) + 1,
        messages,
    };

    debug!(
        thread_id = %merged.id,
        archive_msgs = durable,
        cache_msgs = cache.messages.len(),
        merged_msgs = merged.messages.len(),
        merge_count = merged.merge_count,
        "Reconciled thread"
    );

    Ok(Some(merged))
}
