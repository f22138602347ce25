//! Bounded retry with exponential backoff for identity-provider calls.
//!
//! Every outbound call (JWKS fetch, metadata discovery, token exchange,
//! introspection) runs through [`RetryPolicy::run`]: each attempt gets a hard
//! timeout, and only transport-level failures are retried.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Retry configuration for provider network calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// First backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,
    /// Hard timeout per attempt in seconds
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            attempt_timeout_secs: 10,
        }
    }
}

/// Retry policy applied to provider calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// First backoff delay
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Hard timeout per attempt
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs.max(1)),
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_retries)
            .with_jitter()
    }

    /// Run `f` with a per-attempt timeout, retrying retryable failures.
    ///
    /// A timed-out attempt counts as a `ProviderUnavailable` failure. The last
    /// error is returned once retries are exhausted.
    pub async fn run<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.attempt_timeout;
        let mut f = f;
        let attempt = || {
            let fut = f();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::ProviderUnavailable(format!(
                        "{operation} timed out after {}s",
                        timeout.as_secs()
                    ))),
                }
            }
        };

        attempt
            .retry(self.backoff())
            .when(Error::is_retryable)
            .notify(|err: &Error, delay: Duration| {
                debug!(
                    operation = operation,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Retrying after backoff"
                );
            })
            .await
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            attempt_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn transport_failures_are_retried_then_surface() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = fast_policy(2)
            .run("jwks", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::ProviderUnavailable("connection refused".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::ProviderUnavailable(_))));
        // 1 initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = fast_policy(2)
            .run("exchange", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::TokenRejected("bad audience".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::TokenRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempt_times_out_as_provider_unavailable() {
        let result: Result<()> = fast_policy(0)
            .run("metadata", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result {
            Err(Error::ProviderUnavailable(msg)) => assert!(msg.contains("metadata timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = fast_policy(2)
            .run("jwks", || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::ProviderUnavailable("reset".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
