//! Bounded retry with exponential backoff and per-call timeouts for calls to
//! external services. No external call in this system may block indefinitely.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::CommonError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy for tests and fast in-process doubles.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            call_timeout: Duration::from_secs(2),
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `operation` under the policy's per-call timeout, retrying retryable
/// errors with exponential backoff. Non-retryable errors (tenant mismatch,
/// permission denial, integrity violations) surface immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T, CommonError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CommonError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match tokio::time::timeout(policy.call_timeout, operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) if attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(op = op_name, attempt, "call timed out, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(_elapsed) => {
                return Err(CommonError::KeyUnavailable {
                    msg: format!("{op_name} timed out after {attempt} attempts"),
                    source: None,
                });
            }
        }
    }
}
