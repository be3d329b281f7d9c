//! Retry logic with exponential backoff
//!
//! Two budgets are supported: a fixed number of attempts
//! ([`retry_with_backoff`]) and a wall deadline ([`retry_until`]), the latter
//! used by write-backs that must land before a cache entry expires.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (ignored by [`retry_until`])
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum attempts
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set initial delay
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the given (1-based) failed attempt
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = base_ms.min(self.max_delay.as_millis() as f64) as u64;

        let delay_ms = if self.jitter {
            // up to 25% on top
            delay_ms + jitter_ms(delay_ms / 4)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }
}

fn jitter_ms(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or(0);
    nanos % max
}

/// Error type for retry operations
#[derive(Debug)]
pub struct RetryError<E> {
    /// The last error encountered
    pub last_error: E,
    /// Total number of attempts made
    pub attempts: u32,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "operation failed after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryError<E> {}

/// Execute an async operation, retrying up to `config.max_attempts` times
///
/// Non-retryable errors are returned after the first attempt.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    config: &RetryConfig,
    mut operation: F,
    is_retryable: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Debug,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = config.delay_for(attempt);
                warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = ?e,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
            Err(e) => {
                debug!(attempt = attempt, error = ?e, "Operation failed, no more retries");
                return Err(RetryError {
                    last_error: e,
                    attempts: attempt,
                });
            }
        }
    }
}

/// Execute an async operation, retrying until `deadline`
///
/// Backoff delays are clipped to the time left, and one last attempt is made
/// right at the deadline. `config.max_attempts` is not consulted.
pub async fn retry_until<T, E, F, Fut, R>(
    deadline: Instant,
    config: &RetryConfig,
    mut operation: F,
    is_retryable: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Debug,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let last_error = match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !is_retryable(&last_error) || remaining.is_zero() {
            debug!(
                attempt = attempt,
                error = ?last_error,
                "Operation failed, retry window closed"
            );
            return Err(RetryError {
                last_error,
                attempts: attempt,
            });
        }

        let delay = config.delay_for(attempt).min(remaining);
        warn!(
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            remaining_ms = remaining.as_millis() as u64,
            error = ?last_error,
            "Operation failed, retrying before deadline"
        );
        sleep(delay).await;
    }
}
