//! Retry policy for flaky instrument transports.
//!
//! The instrument manager retries opens with this policy before reporting an
//! instrument as unavailable.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts (1 = no retry).
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    /// The delay between attempts.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff_delay: Duration,
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff() -> Duration {
    Duration::from_millis(100)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            backoff_delay: default_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no delay.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted; returns the last error.
pub async fn retry_with_policy<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> anyhow::Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!(attempt, error = %e, "attempt failed, retrying");
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
