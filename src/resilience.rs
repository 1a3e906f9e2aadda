//! Retry with exponential backoff and jitter.
//!
//! Any network or browser call can be wrapped in a [`RetryPolicy`]. Only
//! errors whose kind is retryable (network, browser automation) are retried;
//! authentication, validation, and filesystem errors are returned at once.
//!
//! # Backoff Strategy
//!
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=max_jitter)
//! ```
//!
//! [`RetryFetch`] applies a policy to any [`HttpFetch`] implementation, so the
//! download manager can treat the retrying fetcher like the plain one.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::{Rng, rng};
use tokio::time::sleep;
use tracing::{error, instrument, warn};

use crate::collaborators::HttpFetch;
use crate::config::RetryConfig;
use crate::error::{EngineError, ErrorContext};

/// Bounded retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Initial delay between retries (doubles with each attempt).
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }

    /// No delays at all; used where retries must not stall (and in tests).
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Exponential part of the delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng().random_range(0..=max_ms))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. `op` receives the 1-based attempt number.
    #[instrument(level = "debug", skip_all, fields(operation = %ctx.operation))]
    pub async fn run<T, F, Fut>(&self, ctx: &ErrorContext, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let attempt_t0 = Instant::now();
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let mut e = e.at_attempt(attempt);
                    if let Some(target) = &ctx.target_id {
                        e = e.for_target(target);
                    }
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            error = %e,
                            "{} exhausted retries", ctx.operation
                        );
                        return Err(e);
                    }

                    let delay = self.backoff_delay(attempt) + self.jitter();
                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_t0.elapsed().as_millis() as u64,
                        ?delay,
                        error = %e,
                        "{} attempt failed; backing off", ctx.operation
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}

/// Decorator adding a [`RetryPolicy`] to any [`HttpFetch`] implementation.
pub struct RetryFetch<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> RetryFetch<T>
where
    T: HttpFetch,
{
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T> fmt::Debug for RetryFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFetch")
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T> HttpFetch for RetryFetch<T>
where
    T: HttpFetch,
{
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError> {
        let ctx = ErrorContext::new("fetch_image");
        self.policy.run(&ctx, |_| self.inner.fetch(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::ZERO,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(16));
        assert_eq!(policy.backoff_delay(6), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(60), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retries_network_errors_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);
        let result = policy
            .run(&ErrorContext::new("op"), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(EngineError::network(ErrorContext::new("op"), "reset"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(2);
        let err = policy
            .run(&ErrorContext::new("op").with_target("t1"), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(EngineError::browser(ErrorContext::new("op"), "crash")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.kind(), ErrorKind::BrowserAutomation);
        assert_eq!(err.context().attempt, 3);
        assert_eq!(err.context().target_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_authentication_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let err = policy
            .run(&ErrorContext::new("op"), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(EngineError::authentication(ErrorContext::new("op"), "expired"))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_filesystem_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let _ = policy
            .run(&ErrorContext::new("op"), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(EngineError::filesystem(ErrorContext::new("op"), "ro")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
