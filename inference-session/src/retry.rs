//! Retry with backoff.
//!
//! Wraps a whole submit from the outside. Every attempt is a fresh call, so
//! on the encrypted channel each retry is a new request id and a new counter.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::ProtocolError;

/// When and how often to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Backoff base in seconds
    pub base: f64,
    /// Cap on any single wait
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: config.base,
            max_delay: config.max_delay_ms.map(Duration::from_millis),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: f64) -> Self {
        Self {
            max_attempts,
            base,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Wait before the retry that follows failed attempt `attempt` (from 1).
    ///
    /// The error's `retry_after` hint wins; otherwise `base^attempt` seconds.
    pub fn delay_for(&self, error: &ProtocolError, attempt: u32) -> Duration {
        let ceiling = self.max_delay.unwrap_or(Duration::MAX);
        let delay = error.retry_after().unwrap_or_else(|| {
            let secs = self.base.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
            if secs.is_nan() || secs <= 0.0 {
                Duration::ZERO
            } else {
                // Past the representable range: saturate to the cap.
                Duration::try_from_secs_f64(secs).unwrap_or(ceiling)
            }
        });

        delay.min(ceiling)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` attempts have been made.
///
/// The last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, ProtocolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProtocolError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(&err, attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    code = err.category().code(),
                    "Retrying after error: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
