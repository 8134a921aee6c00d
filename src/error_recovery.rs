//! Bounded retry of instrument calls.
//!
//! Every adapter call made by a controller goes through [`with_retry`]: each
//! attempt is bounded by the policy's timeout, failed attempts are retried
//! with exponential backoff, and once `max_attempts` is exhausted the last
//! error is returned. No call can hang a control loop indefinitely.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::config::InstrumentConfig;
use crate::instrument::InstrumentError;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Upper bound for a single attempt.
    pub timeout: Duration,
    /// The delay before the first retry. Doubles after each failure.
    pub backoff_delay: Duration,
    /// Cap for the doubled delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(5),
            backoff_delay: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl From<&InstrumentConfig> for RetryPolicy {
    fn from(config: &InstrumentConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            timeout: config.timeout,
            backoff_delay: config.backoff,
            max_backoff: config.max_backoff,
        }
    }
}

/// Result of a retried call: the value plus how many retries it needed.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    /// What the call returned
    pub value: T,
    /// Failed attempts before it succeeded
    pub retries: u32,
}

/// Error after the retry budget was exhausted.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("gave up after {attempts} attempts: {last_error}")]
pub struct RetryExhausted {
    /// Attempts made, including the first
    pub attempts: u32,
    /// Error of the final attempt
    #[source]
    pub last_error: InstrumentError,
}

/// Runs `operation` under `policy`, retrying transient failures.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<Retried<T>, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, InstrumentError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut delay = policy.backoff_delay;
    let mut last_error = InstrumentError::Timeout;

    for attempt in 0..attempts {
        let outcome = match timeout(policy.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(InstrumentError::Timeout),
        };
        match outcome {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    retries: attempt,
                })
            }
            Err(err) => {
                debug!(operation = what, attempt = attempt + 1, %err, "instrument call failed");
                last_error = err;
            }
        }
        if attempt + 1 < attempts {
            sleep(delay).await;
            delay = (delay * 2).min(policy.max_backoff);
        }
    }

    Err(RetryExhausted {
        attempts,
        last_error,
    })
}
