//! Retry middleware for transport operations

use std::time::Duration;

use tracing::{debug, warn};

use crate::Result;

/// Exponential backoff policy
///
/// Attempt `n` (zero-based) waits `initial_delay * backoff_multiplier^n`,
/// clamped to `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries allowed after the first try
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Wait before retry number `attempt + 1`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let scaled = self.initial_delay.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}

/// Retry middleware for transport operations
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    /// Wrap operations with the backoff described by `config`
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds or the policy gives up
    ///
    /// Non-retryable errors return immediately. Once the attempts are used up
    /// the last error is returned so callers still see the server's payload.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "Transport call recovered");
                    }
                    return Ok(result);
                }
                Err(e) if !e.is_retryable() => {
                    debug!("Not retrying: {e}");
                    return Err(e);
                }
                Err(e) if attempt >= self.config.max_attempts => {
                    warn!("Giving up after {} attempts: {}", attempt + 1, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.config.calculate_delay(attempt);
                    warn!(
                        "Request failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        self.config.max_attempts + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
