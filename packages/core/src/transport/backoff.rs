use std::time::Duration;

use rand::Rng;

/// Exponential reconnect delay with random jitter, capped at `max`.
///
/// Each call to [`next_delay`](Backoff::next_delay) doubles the base delay
/// and picks a value between half of it and all of it. [`reset`](Backoff::reset)
/// after a successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base: base.max(Duration::from_millis(1)),
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let ceiling = exp.as_millis() as u64;
        let floor = ceiling / 2;
        let millis = rand::thread_rng().gen_range(floor..=ceiling);
        Duration::from_millis(millis)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
