//! Retry with exponential backoff for store and queue calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use debate_state::{QueueError, StorageError};

use crate::config::RetryConfig;

/// Errors that may succeed when retried.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}

impl Transient for QueueError {
    fn is_transient(&self) -> bool {
        QueueError::is_transient(self)
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay_ms`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Run `op` until it succeeds, fails permanently, or `max_attempts` is spent.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let delay = config.delay(attempt);
                warn!(
                    event = "retry.scheduled",
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
