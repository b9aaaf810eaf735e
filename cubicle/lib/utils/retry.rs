//! Exponential-backoff retry for transient failures.

use std::{future::Future, time::Duration};

use tracing::{error, warn};

use crate::CubicleResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Retry schedule for operations against storage and driver backends.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: u32,

    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RetryPolicy {
    /// The schedule used for snapshot backend calls: base 200 ms, doubling,
    /// at most 5 attempts.
    pub fn backend() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            backoff_factor: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::backend()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `op`, retrying transient failures according to `policy`.
///
/// Non-transient errors propagate immediately; the final transient error is
/// returned once attempts are exhausted.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
) -> CubicleResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CubicleResult<T>>,
{
    let mut delay = policy.base_delay;

    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "transient failure, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * policy.backoff_factor).min(policy.max_delay);
            }
            Err(e) => {
                if e.is_transient() {
                    error!(operation, attempts = policy.max_attempts, error = %e, "retries exhausted");
                }
                return Err(e);
            }
        }
    }

    unreachable!("retry loop always returns")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::CubicleError;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2,
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(fast_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CubicleError::Transient("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: CubicleResult<()> = with_retry(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CubicleError::Fatal("broken".into())) }
        })
        .await;

        assert!(matches!(result, Err(CubicleError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: CubicleResult<()> = with_retry(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CubicleError::Transient("down".into())) }
        })
        .await;

        assert!(matches!(result, Err(CubicleError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
