//! Mneme Core - Two-tier conversation memory
//!
//! This crate keeps multi-turn conversation threads alive across restarts,
//! instances and cache evictions:
//! - Thread: the conversation record and its cache/archive wrappers
//! - Cache: volatile, TTL-bearing tier (memory, Redis)
//! - Archive: durable tier (SQLite, memory)
//! - Merge: positional reconciliation of the two copies of a thread
//! - Coordinator: restore-or-create, mutation, write-back and deletion
//! - Scheduler: per-thread write-back timers ahead of cache expiry
//! - Utils: retry with exponential backoff

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod archive;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod scheduler;
pub mod thread;
pub mod utils;

pub use archive::{ArchivalStore, ArchiveBackend, MemoryArchivalStore, SqliteArchivalStore};
pub use cache::{CacheBackend, CacheStore, MemoryCacheStore, RedisCacheStore};
pub use config::{ArchiveConfig, CacheConfig, MemoryConfig, WriteBackConfig};
pub use coordinator::{ListSource, SessionCoordinator, SessionInfo};
pub use error::{Error, Result, StoreKind};
pub use merge::reconcile;
pub use scheduler::{WriteBackOutcome, WriteBackScheduler};
pub use thread::{
    ArchivalRecord, CacheRecord, Message, MessageRole, Thread, ThreadLocation, ThreadSummary,
};
pub use utils::{RetryConfig, RetryError};
