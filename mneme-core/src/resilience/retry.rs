//! Backoff policy for durable writes
//!
//! The cold tier archiver waits `delay_for_attempt(n)` after its n-th
//! consecutive failed batch. Delays grow geometrically from `initial_delay`,
//! are capped at `max_delay`, and get a random extra of up to `jitter` of the
//! capped value.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Backoff and attempt limits for archive writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a rejected record is dead-lettered; also bounds the
    /// shutdown drain
    pub max_attempts: usize,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor per failed attempt, at least 1
    pub multiplier: f64,
    /// Extra random fraction of the delay, in [0, 1]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Fraction of random extra delay; `0.0` makes delays deterministic
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay after the `attempt`-th consecutive failure (0-based)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let growth = self.multiplier.max(1.0).powi(exponent);
        let capped_ms = (self.initial_delay.as_millis() as f64 * growth)
            .min(self.max_delay.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let extra_ms = if jitter > 0.0 {
            capped_ms * jitter * unit_random()
        } else {
            0.0
        };
        Duration::from_millis((capped_ms + extra_ms) as u64)
    }
}

/// Uniform sample in [0, 1) from the low 53 bits of a v4 UUID, which are
/// all random
fn unit_random() -> f64 {
    const MANTISSA: u64 = 1 << 53;
    let bits = Uuid::new_v4().as_u128() as u64 & (MANTISSA - 1);
    bits as f64 / MANTISSA as f64
}
