//! Bounded retry with exponential backoff for backend reads.

use std::future::Future;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::warn;

use super::error::{BackendError, BackendResult};

const SOURCE: &str = "cache::backend::retry";

/// Retry behaviour for idempotent backend calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(2.0)
            .with_max_elapsed_time(None) // bounded by max_attempts
            .build()
    }
}

/// Run `operation` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// Only errors for which [`BackendError::is_transient`] holds are retried. Writes must not
/// go through here.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    mut operation: F,
) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    let mut retries = 0;

    backoff::future::retry_notify(
        policy.backoff(),
        || {
            attempt += 1;
            let current = attempt;
            let call = operation();
            async move {
                call.await.map_err(|err| {
                    if current >= max_attempts || !err.is_transient() {
                        backoff::Error::permanent(err)
                    } else {
                        backoff::Error::transient(err)
                    }
                })
            }
        },
        |err: BackendError, delay: Duration| {
            retries += 1;
            warn!(
                target = SOURCE,
                op,
                attempt = retries,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Backend read failed; retrying"
            );
        },
    )
    .await
}

/// Bound a single backend call by `limit`.
pub async fn bounded<T, Fut>(limit: Duration, op: &'static str, future: Fut) -> BackendResult<T>
where
    Fut: Future<Output = BackendResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout {
            op,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}
