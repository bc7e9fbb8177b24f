use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// `delay = min(base * multiplier^attempt, max_delay) + uniform(0, jitter_max)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Deterministic component for the given zero-based attempt.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max_delay
        }
    }

    /// Uniform jitter in `[0, jitter_max)`.
    pub fn jitter<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let max_ms = self.jitter_max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..max_ms))
    }

    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        self.base_delay(attempt) + self.jitter(rng)
    }

    /// True once `failed_attempts` has reached the cap.
    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        self.max_attempts > 0 && failed_attempts >= self.max_attempts
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_max: Duration::from_millis(config.jitter_max_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}
