//! Bounded exponential backoff with jitter for transient collaborator failures.
//!
//! The combinator is applied at call sites on the collaborator boundary
//! (see [`crate::control::Retrying`]); orchestration code never retries on
//! its own.

use crate::config::RetryConfig;
use crate::utils::errors::{BackupError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy: attempt cap plus backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            ..Self::default()
        }
    }

    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Upper bound of the delay before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powf(attempt.saturating_sub(1) as f64);
        let delay_ms = (self.base_delay.as_millis() as f64 * factor) as u64;
        std::cmp::min(Duration::from_millis(delay_ms), self.max_delay)
    }

    /// Full jitter: uniformly random delay between zero and the backoff bound.
    fn jittered(&self, attempt: u32) -> Duration {
        let bound = self.backoff(attempt).as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt cap is reached. The last error is returned unchanged.
pub async fn retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&BackupError) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if attempt >= policy.max_attempts || !is_retryable(&error) {
                    return Err(error);
                }

                let delay = policy.jittered(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %error,
                    "Retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
