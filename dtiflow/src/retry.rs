//! Bounded retry with capped exponential backoff.
//!
//! Used for transient infrastructure failures such as storage transfers.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry - 1)`, capped.
    #[must_use]
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let exp = u32::try_from(retry.max(1) - 1).unwrap_or(u32::MAX);
        let delay = self.base_delay_ms.saturating_mul(2u64.saturating_pow(exp));
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Executes an operation with bounded retry.
///
/// The operation receives the 1-based attempt number. The last error is
/// returned once attempts are exhausted.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= config.max_attempts => return Err(e),
            Err(e) => {
                let delay = config.delay_for_retry(attempt);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
