// SPDX-License-Identifier: MIT
//! Reconnect delay schedule — deterministic exponential backoff with a cap
//! and an attempt budget.
//!
//! `delay(n) = min(initial_delay · multiplier^(n-1), max_delay)`. No I/O and
//! no locking; the session wraps one instance in its own mutex.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Attempt budget; 0 means retry forever.
    pub max_attempts: u32,
    current_attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60), 2.0, 0)
    }
}

impl Backoff {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            max_attempts,
            current_attempt: 0,
        }
    }

    /// `true` while the attempt budget is not exhausted.
    pub fn can_retry(&self) -> bool {
        self.max_attempts == 0 || self.current_attempt < self.max_attempts
    }

    /// Consume one attempt and return the delay to sleep before it.
    pub fn next_delay(&mut self) -> Duration {
        self.current_attempt = self.current_attempt.saturating_add(1);
        self.delay_for(self.current_attempt)
    }

    /// The pure schedule, 1-indexed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }
        let factor = self.multiplier.powi(attempt as i32 - 1);
        let ms = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    /// Called on every successful connect.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}
