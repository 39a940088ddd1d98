//! Bounded exponential backoff for transient infrastructure errors
//!
//! Only `StepError::TransientInfra` is retried. Every other error is returned
//! on the first occurrence, so conflicts and missing resources are never
//! papered over by a retry.

use crate::error::{StepError, StepResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Backoff configuration for retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Attempts including the first call
    pub max_attempts: u32,

    /// Delay before the second attempt (milliseconds)
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds)
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Randomize each delay within `[delay / 2, delay]`
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// No delays and no jitter; for tests and dry runs
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0) as u64;

        let millis = if self.jitter && capped > 1 {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

/// Runs an operation under a `BackoffConfig`
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: BackoffConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Call `op` until it succeeds, fails non-transiently, or the attempt
    /// budget runs out.
    ///
    /// # Errors
    /// - the first non-transient error `op` returns
    /// - `StepError::RetriesExhausted` wrapping the last transient error
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> StepResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StepResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    if attempt >= max_attempts {
                        tracing::warn!(operation, attempts = attempt, error = %err, "retry budget exhausted");
                        return Err(StepError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }

                    let delay = self.config.delay_for(attempt);
                    metrics::counter!("promo_transient_retries_total", "operation" => operation)
                        .increment(1);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
