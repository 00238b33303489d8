//! Retry with exponential backoff for transient broker errors.
//!
//! Only `QueueError::Transient` is retried. Everything else is returned to
//! the caller on the first failure.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::{QueueError, QueueResult};

/// Bounded doubling backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt.
    pub base: Duration,
    /// Cap on any single delay.
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            max,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(200), Duration::from_secs(10))
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> QueueResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QueueResult<T>>,
{
    let mut delay = policy.base;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(QueueError::Transient(reason)) if attempt < policy.attempts => {
                warn!(
                    operation = what,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %reason,
                    "transient broker error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2).min(policy.max);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
