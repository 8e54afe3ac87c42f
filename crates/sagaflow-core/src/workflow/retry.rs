//! Retry policies with fixed and exponential backoff.
//!
//! A `RetryPolicy` is immutable and attached to a step. Attempts are 1-based
//! and `max_attempts` counts the first execution, so `max_attempts = 1` means
//! "never retry".

use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Wait the same delay before every retry.
    Fixed { delay: Duration },
    /// Wait `base * 2^(n-1)` after failed attempt `n`, optionally capped.
    Exponential {
        base: Duration,
        max_delay: Option<Duration>,
    },
}

/// How many times a step may run and how long to wait between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, BackoffStrategy::None)
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, BackoffStrategy::Fixed { delay })
    }

    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self::new(
            max_attempts,
            BackoffStrategy::Exponential {
                base,
                max_delay: None,
            },
        )
    }

    /// Cap exponential delays. No effect on other strategies.
    pub fn with_max_delay(mut self, cap: Duration) -> Self {
        if let BackoffStrategy::Exponential { max_delay, .. } = &mut self.backoff {
            *max_delay = Some(cap);
        }
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> BackoffStrategy {
        self.backoff
    }

    /// Whether another attempt may follow failed attempt `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after failed attempt `attempt` (1-based) before the next one.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => delay,
            BackoffStrategy::Exponential { base, max_delay } => {
                let exponent = attempt.saturating_sub(1);
                let delay = 1u32
                    .checked_shl(exponent)
                    .and_then(|factor| base.checked_mul(factor))
                    .unwrap_or(Duration::MAX);
                match max_delay {
                    Some(cap) => delay.min(cap),
                    None => delay,
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
