//! Bounded exponential backoff
//!
//! Used for retrying transient platform calls and for spacing out
//! state polls while waiting on an instance transition.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::PlatformError;

/// Retry policy for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Total attempts including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given 1-based failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff)
    }

    /// Run `op`, retrying transient platform errors until attempts run out.
    ///
    /// Terminal and not-found errors are returned immediately.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = %operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient platform error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Outcome of polling for a condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Reached(T),
    TimedOut,
}

/// Call `check` until it yields `Some`, growing the interval between calls
/// from `interval` up to `max_interval`, and giving up after `timeout`.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    max_interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<PollOutcome<T>, PlatformError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, PlatformError>>,
{
    let deadline = Instant::now() + timeout;
    let mut wait = interval;
    let mut polls = 0u32;

    loop {
        polls += 1;
        if let Some(value) = check().await? {
            debug!(what = %what, polls, "Condition reached");
            return Ok(PollOutcome::Reached(value));
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(what = %what, polls, timeout_ms = timeout.as_millis() as u64, "Timed out waiting");
            return Ok(PollOutcome::TimedOut);
        }

        tokio::time::sleep(wait.min(deadline - now)).await;
        wait = wait.saturating_mul(2).min(max_interval.max(interval));
    }
}

/// Serde helper for durations expressed in milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
