//! Exponential-backoff retry around any fallible async unit of work.
//!
//! Every failure is retried the same way: the wrapper does not try to tell
//! transient errors from permanent ones. Callers that must fail fast
//! (validation) check their inputs before entering the wrapper.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Attempt budget and backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay }
    }

    /// Backend reads/writes: 3 attempts, 1s base.
    pub const fn backend() -> Self {
        Self::new(3, Duration::from_secs(1))
    }

    /// SMTP sends: 3 attempts, 250ms base.
    pub const fn smtp() -> Self {
        Self::new(3, Duration::from_millis(250))
    }

    /// No waiting between attempts.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay slept after the failed attempt `attempt` (0-based): `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::backend()
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
/// The last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(label: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!("{label}: succeeded on attempt {}", attempt + 1);
                }
                return Ok(value);
            }
            Err(e) if attempt + 1 >= attempts => {
                tracing::warn!("{label}: giving up after {attempts} attempt(s): {e}");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    "{label}: attempt {} failed ({e}), retrying in {:?}",
                    attempt + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
