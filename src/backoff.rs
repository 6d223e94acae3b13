//! Bounded exponential retry for collaborator calls
//!
//! Every collaborator adapter retries transient failures here before
//! surfacing `CollaboratorError::Unavailable` to the workflow.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{CollabResult, CollaboratorError};

/// Retry policy: `attempts` tries total, exponential delay with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `n` (0-based), doubled each time, jittered ±25%.
    fn delay(&self, retry: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << retry.min(10));
        let capped = exp.min(self.max_delay);
        let jitter = rand::rng().random_range(0.75..1.25);
        capped.mul_f64(jitter)
    }
}

/// Run `op` with retries and an overall deadline.
///
/// Timeouts count as transient. A deadline overrun on the final attempt is
/// reported as `Deadline` so the workflow can tell slowness from refusal.
pub async fn retry_with_deadline<T, F, Fut>(
    service: &'static str,
    policy: RetryPolicy,
    deadline: Duration,
    mut op: F,
) -> CollabResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CollabResult<T>>,
{
    let mut last_err = None;
    for attempt in 0..policy.attempts {
        match tokio::time::timeout(deadline, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                // Invalid responses are not transient; retrying the same
                // request would return the same garbage.
                if matches!(err, CollaboratorError::InvalidResponse { .. }) {
                    return Err(err);
                }
                warn!(service, attempt, error = %err, "collaborator call failed");
                last_err = Some(err);
            }
            Err(_) => {
                warn!(service, attempt, millis = deadline.as_millis() as u64, "collaborator call timed out");
                last_err = Some(CollaboratorError::Deadline {
                    service,
                    millis: deadline.as_millis() as u64,
                });
            }
        }
        if attempt + 1 < policy.attempts {
            tokio::time::sleep(policy.delay(attempt)).await;
        }
    }
    Err(last_err.unwrap_or_else(|| CollaboratorError::unavailable(service, "no attempts made")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_deadline("test", RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }, Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CollaboratorError::unavailable("test", "flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_response_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: CollabResult<u32> = retry_with_deadline(
            "test",
            RetryPolicy::default(),
            Duration::from_secs(1),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CollaboratorError::invalid("test", "nonsense")) }
            },
        )
        .await;
        assert!(matches!(result, Err(CollaboratorError::InvalidResponse { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_last_error() {
        let result: CollabResult<u32> = retry_with_deadline(
            "test",
            RetryPolicy {
                attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            Duration::from_secs(1),
            || async { Err(CollaboratorError::unavailable("test", "down")) },
        )
        .await;
        assert!(matches!(result, Err(CollaboratorError::Unavailable { .. })));
    }
}
