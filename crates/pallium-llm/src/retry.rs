//! Retry policy for opening provider streams.
//!
//! Transient transport failures (timeout, 5xx, connection reset) are retried
//! exactly once, with exponential backoff bounded so the total added delay
//! never exceeds [`RetryPolicy::max_total_delay_ms`]. Everything else
//! surfaces immediately.

use std::future::Future;

use tracing::warn;

use crate::provider::{ProviderError, ProviderResult};

/// Bounds for the single-retry policy.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Hard cap on the summed backoff delay.
    pub max_total_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay_ms: 500,
            max_total_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry `attempt` (1-based), respecting the total
    /// cap given `spent_ms` already waited.
    #[must_use]
    pub fn delay_ms(&self, attempt: u32, spent_ms: u64) -> u64 {
        let exponential = self
            .base_delay_ms
            .saturating_mul(1_u64 << attempt.saturating_sub(1).min(31));
        exponential.min(self.max_total_delay_ms.saturating_sub(spent_ms))
    }
}

/// Run `op`, retrying once on a retryable [`ProviderError`].
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut spent_ms = 0_u64;
    let mut attempt = 0_u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay_ms(attempt, spent_ms);
                warn!(
                    category = err.category(),
                    attempt, delay_ms = delay, "provider call failed, retrying"
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                spent_ms = spent_ms.saturating_add(delay);
            }
            Err(err) => return Err(err),
        }
    }
}
