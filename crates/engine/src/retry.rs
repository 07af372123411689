//! Bounded retry for compare-and-swap writes

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{EngineError, EngineResult};

const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Retries an operation while it fails with [`EngineError::Conflict`].
///
/// Every other error is returned immediately. When the retries run out the
/// last `Conflict` is surfaced so the caller can re-issue the request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: usize,
    base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms: base_delay_ms.max(1),
        }
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub async fn run<T, F, Fut>(&self, operation: &'static str, action: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.base_delay_ms)
            .max_delay(MAX_BACKOFF)
            .map(jitter)
            .take(self.max_retries);

        RetryIf::spawn(strategy, action, |err: &EngineError| {
            let retry = matches!(err, EngineError::Conflict(_));
            if retry {
                tracing::warn!(operation, error = %err, "Lost compare-and-swap race, retrying");
            }
            retry
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy::new(5, 1);

        let result = policy
            .run("test", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::Conflict("busy".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_surfaces_conflict_after_budget() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy::new(3, 1);

        let result: EngineResult<()> = policy
            .run("test", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Conflict("always".into())) }
            })
            .await;

        assert!(matches!(result, Err(EngineError::Conflict(_))));
        // First attempt plus three retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_does_not_retry_validation_errors() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy::new(5, 1);

        let result: EngineResult<()> = policy
            .run("test", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::DiscountInactive("X".into())) }
            })
            .await;

        assert!(matches!(result, Err(EngineError::DiscountInactive(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
