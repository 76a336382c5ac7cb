//! Bounded, jittered exponential backoff shared by the classifier and the
//! mailbox reconnect path.

use std::time::Duration;

use rand::Rng;

/// Retry schedule: `base * 2^(attempt-1)`, capped at `max`, plus up to
/// `jitter` (fraction of the delay) of random extra wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
            max_attempts: 3,
            jitter: 0.25,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based) without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay before retry number `attempt` (1-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = base.mul_f64(self.jitter * rand::thread_rng().gen_range(0.0..=1.0));
        base + extra
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
