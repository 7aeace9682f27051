//! Bounded exponential backoff.
//!
//! Every reconnect path in the session (trading relogin, market-data
//! reconnect, subscription replay) retries through [`retry`] so the delay
//! schedule and the attempt bound are the same everywhere. Only errors for
//! which [`FbError::is_retryable`] holds are retried; anything else ends the
//! loop immediately.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::{FbError, Result};

/// Delay schedule and attempt bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub initial: Duration,
    /// Upper bound for a single delay.
    pub max: Duration,
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self { initial, max: max.max(initial), max_attempts: max_attempts.max(1) }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 5)
    }
}

/// Stateful iterator over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` once the attempt bound is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt + 1 >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt bound is exhausted. `op` receives the 0-based attempt
/// number.
pub async fn retry<T, F, Fut>(label: &str, policy: BackoffPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(policy);
    loop {
        let attempt = backoff.attempts();
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                error!("[{label}] attempt {attempt} failed with non-retryable error: {e}");
                return Err(e);
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!("[{label}] attempt {attempt} failed: {e}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!("[{label}] giving up after {} attempts: {e}", attempt + 1);
                    return Err(FbError::Connectivity(format!(
                        "{label}: retry bound of {} attempts exceeded ({e})",
                        policy.max_attempts
                    )));
                }
            },
        }
    }
}
