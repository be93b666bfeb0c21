use std::time::Duration;
use tracing::warn;

/// Decision returned by the retry policy when a watched file is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay` then look again (1-based attempt number).
    Retry { attempt: u32, delay: Duration },
    /// Retry ceiling reached; the file is considered gone.
    GiveUp,
}

/// Linear backoff for a file that has disappeared mid-watch.
///
/// Attempt `n` waits `base * n`, capped at `max_delay`. A successful read
/// resets the counter so that later disappearances get the full budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            current_attempt: 0,
        }
    }

    /// Record one more miss and decide what to do next.
    pub fn evaluate(&mut self) -> RetryDecision {
        self.current_attempt += 1;

        if self.current_attempt <= self.max_retries {
            let delay = self
                .base_delay
                .saturating_mul(self.current_attempt)
                .min(self.max_delay);
            RetryDecision::Retry {
                attempt: self.current_attempt,
                delay,
            }
        } else {
            warn!(
                max_retries = self.max_retries,
                "file still missing after retries, giving up"
            );
            RetryDecision::GiveUp
        }
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Exponential reconnect delay: `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let shift = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(shift).min(max)
}
