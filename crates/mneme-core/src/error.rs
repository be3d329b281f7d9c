//! Error types for mneme-core
//!
//! There is no `NotFound` variant: a thread missing from a tier is a valid
//! state and is modelled as `Ok(None)` by every store.

use thiserror::Error;

/// Which tier an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Volatile TTL-bearing cache tier
    Cache,
    /// Durable archival tier
    Archive,
}

impl StoreKind {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Archive => "archive",
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Backing store could not be reached (transient, retryable)
    #[error("{store} store unavailable: {message}")]
    StoreUnavailable {
        /// Tier that failed
        store: StoreKind,
        /// Underlying cause
        message: String,
    },

    /// Concurrent writers to one thread were observed
    #[error("write conflict on thread {thread_id}: {message}")]
    WriteConflict {
        /// Thread being written
        thread_id: String,
        /// Detailed message
        message: String,
    },

    /// Write-back kept failing until the cache entry expired
    #[error("durability lag exceeded for thread {thread_id} after {attempts} attempts")]
    DurabilityLagExceeded {
        /// Thread whose latest turns were not archived
        thread_id: String,
        /// Write-back attempts made before the deadline
        attempts: u32,
    },

    /// Thread does not exist in any tier
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    /// Invalid configuration
    #[error("invalid configuration: {field}: {message}")]
    InvalidConfig {
        /// Config field name
        field: String,
        /// Detailed message
        message: String,
    },

    /// Record (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a cache-tier outage
    pub fn cache_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            store: StoreKind::Cache,
            message: message.into(),
        }
    }

    /// Shorthand for an archive-tier outage
    pub fn archive_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            store: StoreKind::Archive,
            message: message.into(),
        }
    }

    /// Whether the operation may succeed if retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Whether this is an outage of the given tier
    #[must_use]
    pub fn is_unavailable(&self, kind: StoreKind) -> bool {
        matches!(self, Self::StoreUnavailable { store, .. } if *store == kind)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
