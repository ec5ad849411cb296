use std::thread;
use std::time::Duration;

use crate::error::GateError;

/// Bounded exponential backoff for transient storage and broker failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping; for tests and local runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error,
    /// or `max_attempts` is exhausted. The last error is returned.
    pub fn run<T, F>(&self, operation: &str, mut attempt_fn: F) -> Result<T, GateError>
    where
        F: FnMut() -> Result<T, GateError>,
    {
        let mut attempt = 0u32;
        loop {
            match attempt_fn() {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::error!(
                            operation,
                            attempts = attempt + 1,
                            error = %err,
                            "retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
