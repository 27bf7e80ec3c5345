//! Timeout and bounded retry around collaborator calls.

use crate::error::CollaboratorError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Hard ceiling on retries regardless of configuration.
pub const MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallPolicy {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 2,
            retry_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl CallPolicy {
    /// No retries, no backoff; used by tests and offline tooling.
    pub fn immediate(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            max_retries: 0,
            retry_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retries(&self) -> u32 {
        self.max_retries.min(MAX_RETRIES)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms.max(self.retry_backoff_ms));
        Duration::from_millis(ms)
    }
}

/// Run `call` under the policy's timeout, retrying retryable failures.
///
/// Returns the last error once retries are exhausted; the caller owns the
/// degradation path.
pub async fn call_with_retry<T, F, Fut>(
    policy: &CallPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, CollaboratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout(), call()).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout {
                operation: operation.to_string(),
                timeout_ms: policy.timeout_ms,
            }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.retries() => {
                attempt += 1;
                let delay = policy.backoff(attempt);
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying collaborator call"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::warn!(operation, attempts = attempt + 1, error = %err, "collaborator call failed");
                return Err(err);
            }
        }
    }
}
