//! Utility modules for mneme-core
//!
//! - retry: Retry logic with exponential backoff, bounded by attempts or by a
//!   deadline

mod retry;

pub use retry::{retry_until, retry_with_backoff, RetryConfig, RetryError};
