//! Bounded fixed-delay retry.
//!
//! Every retry loop in the service is capped: connection establishment at
//! startup, broker polling, and transient store failures while consuming all
//! draw their delays from a [`BoundedConstant`] built from the same
//! [`RetryPolicy`]. When the policy runs out the last error is surfaced as
//! [`Error::RetriesExhausted`].

use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Fixed backoff with an attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay between attempts.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// A fresh backoff yielding `max_attempts - 1` delays.
    pub fn backoff(&self) -> BoundedConstant {
        BoundedConstant {
            delay: self.delay,
            remaining: self.max_attempts.saturating_sub(1),
        }
    }
}

/// `backoff::backoff::Constant` with a ceiling on the number of delays.
#[derive(Debug, Clone)]
pub struct BoundedConstant {
    delay: Duration,
    remaining: u32,
}

impl Backoff for BoundedConstant {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.delay)
    }
}

/// Runs `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Transient errors (see [`Error::is_transient`]) are retried; anything else
/// is returned immediately. Exhaustion is reported as
/// [`Error::RetriesExhausted`] naming `operation`.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    let result = backoff::future::retry_notify(
        policy.backoff(),
        || {
            attempts += 1;
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |err: Error, delay: Duration| {
            warn!(
                operation,
                error = %err,
                retry_in = ?delay,
                "transient failure, retrying"
            );
        },
    )
    .await;

    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => Err(Error::RetriesExhausted {
            operation: operation.to_string(),
            attempts,
            last_error: err.to_string(),
        }),
        Err(err) => Err(err),
    }
}
