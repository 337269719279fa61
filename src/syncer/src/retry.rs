//! Bounded retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use common::config::SyncConfig;

use crate::error::RetryError;
use crate::shutdown::Shutdown;

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Wait after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single wait
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: config.initial_backoff,
            max_delay: config.max_backoff,
        }
    }
}

impl RetryPolicy {
    /// Wait after the given failed attempt (1-based): `initial * 2^(attempt-1)`, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or `policy.max_attempts` is reached.
///
/// The operation receives the 1-based attempt number. A triggered `shutdown`
/// cuts a backoff wait short and yields [`RetryError::Cancelled`]; an attempt
/// that is already running is never interrupted.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    shutdown: &Shutdown,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if shutdown.is_triggered() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                last_error: None,
            });
        }

        attempt += 1;
        log::debug!("{operation_name}: attempt {attempt}/{max_attempts}");

        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    log::info!("{operation_name}: succeeded on attempt {attempt}");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !is_retryable(&error) || attempt >= max_attempts {
            if is_retryable(&error) {
                log::warn!("{operation_name}: all {max_attempts} attempts failed: {error}");
            } else {
                log::warn!("{operation_name}: non-retryable error: {error}");
            }
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let delay = policy.delay_after(attempt);
        log::warn!(
            "{operation_name}: attempt {attempt}/{max_attempts} failed, retrying in {delay:?}: {error}"
        );

        let mut waiter = shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = waiter.triggered() => {
                log::info!("{operation_name}: shutdown requested during backoff");
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last_error: Some(error),
                });
            }
        }
    }
}
