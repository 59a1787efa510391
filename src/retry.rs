//! Bounded retry with exponential backoff.
//!
//! [`with_backoff`] is a plain higher-order async function: it holds no state
//! between calls and knows nothing about what it retries. Delays grow
//! monotonically and carry no jitter, so a run's timing is reproducible.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first; `0` is treated as `1`
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied after each failure
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with `attempts` tries and default delays.
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Policy that never waits, for tests and dry runs.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Attempts actually made.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before attempt `n + 1`, after `n` failures (`n >= 1`).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let factor = self.multiplier.max(1.0);
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..failures {
            let next = delay.as_secs_f64() * factor;
            delay = Duration::from_secs_f64(next.min(self.max_delay.as_secs_f64()));
            if delay >= self.max_delay {
                break;
            }
        }
        delay
    }
}

/// Run `operation` until it succeeds or the policy's attempts run out.
///
/// Returns the first success, or the last error unchanged. Every error is
/// retried; callers that want to stop early must map the error into `Ok`.
pub async fn with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                debug!(operation = %operation_name, attempt, "Operation succeeded");
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Operation failed, no attempts left"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    max_attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
