//! Exponential backoff with jitter.
//! Doubles from `initial` up to `max`; `reset()` after a success.

use rand::Rng;
use std::time::Duration;

/// Default first delay after a failure.
pub const DEFAULT_INITIAL: Duration = Duration::from_secs(1);
/// Default ceiling.
pub const DEFAULT_MAX: Duration = Duration::from_secs(60);

/// Retry delay tracker. Instance-scoped, one per failure domain.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    /// Fraction of the delay added as random jitter (0.0 disables).
    jitter: f64,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
            jitter: 0.1,
            failures: 0,
        }
    }

    /// Disable jitter (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay to wait before the next attempt. Advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        self.failures = self.failures.saturating_add(1);

        if self.jitter <= 0.0 {
            return base;
        }
        let extra = base.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter));
        (base + extra).min(self.max)
    }

    /// Back to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL, DEFAULT_MAX)
    }
}
