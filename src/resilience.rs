//! Bounded retry and fixed-interval polling
//!
//! Every wait in a recovery is bounded by an attempt count. Backoff retries
//! guard steps that may need a moment to converge (the wipe). Fixed-interval
//! polling covers service-up and topology checks, logging progress on a
//! coarser cadence so long waits stay visible without flooding the log.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// An operation that never succeeded within its attempt budget
#[derive(Error, Debug)]
#[error("{operation} gave up after {attempts} attempt(s): {last_error}")]
pub struct Exhausted<E: std::error::Error + 'static> {
    pub operation: String,
    pub attempts: u32,
    pub last_error: E,
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Delay growth per attempt, 1.0 for a fixed interval
    pub backoff_multiplier: f64,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
    /// Log failed attempts at info level every Nth attempt, debug otherwise
    pub log_every: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            log_every: 1,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff starting at `initial_delay`
    pub fn backoff(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: initial_delay.saturating_mul(32),
            ..Default::default()
        }
    }

    /// Fixed interval polling with a progress line every `log_every` attempts
    pub fn polling(max_attempts: u32, interval: Duration, log_every: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            jitter: false,
            log_every: log_every.max(1),
        }
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds or the attempt budget runs out
    #[instrument(skip(self, operation))]
    pub async fn execute<F, Fut, T, E>(&self, name: &str, operation: F) -> Result<T, Exhausted<E>>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let mut delay = self.config.initial_delay;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(operation = name, attempts = attempt, "Operation succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if attempt >= max_attempts {
                        warn!(operation = name, attempts = attempt, error = %error, "Attempts exhausted");
                        return Err(Exhausted {
                            operation: name.to_string(),
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    if attempt % self.config.log_every.max(1) == 0 {
                        info!(
                            operation = name,
                            attempt,
                            max_attempts,
                            error = %error,
                            "Still waiting"
                        );
                    } else {
                        debug!(operation = name, attempt, error = %error, "Attempt failed, retrying in {:?}", delay);
                    }

                    let actual_delay = if self.config.jitter {
                        let jitter_ms =
                            (delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
                        delay + Duration::from_millis(jitter_ms)
                    } else {
                        delay
                    };

                    tokio::time::sleep(actual_delay).await;

                    delay = Duration::from_millis(
                        (delay.as_millis() as f64 * self.config.backoff_multiplier) as u64,
                    )
                    .min(self.config.max_delay);
                }
            }
        }
    }
}
