//! Restart policy for workers that fail with a recoverable error.
//!
//! Exponential backoff with jitter: each delay is the previous one times
//! `multiplier`, capped at `max_delay`, then randomized by ±`jitter_factor`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay, e.g. 0.1 = ±10%.
    pub jitter_factor: f64,
    /// 0 = unlimited.
    pub max_restarts: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_restarts: 0,
        }
    }
}

impl RestartConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug)]
pub struct RestartPolicy {
    config: RestartConfig,
    current_delay: Duration,
    attempts: u32,
}

impl RestartPolicy {
    pub fn new(config: RestartConfig) -> Self {
        let current_delay = config.initial_delay();
        Self {
            config,
            current_delay,
            attempts: 0,
        }
    }

    /// Delay before the next restart, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_restarts > 0 && self.attempts >= self.config.max_restarts {
            return None;
        }
        self.attempts += 1;

        let delay = self.apply_jitter(self.current_delay);

        let scaled = self.current_delay.as_millis() as f64 * self.config.multiplier;
        let next_ms = if scaled.is_finite() && scaled > 0.0 {
            scaled.round() as u64
        } else {
            0
        };
        self.current_delay = Duration::from_millis(next_ms.min(self.config.max_delay_ms));

        Some(delay)
    }

    /// Forget earlier failures after a worker has run stably.
    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay();
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A run lasting at least this long counts as recovered.
    pub fn stable_after(&self) -> Duration {
        self.config.max_delay()
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }
        let base = duration.as_millis() as f64;
        let range = base * self.config.jitter_factor;
        if range <= 0.0 {
            return duration;
        }
        let jitter: f64 = rand::thread_rng().gen_range(-range..=range);
        Duration::from_millis((base + jitter).max(1.0) as u64)
    }
}
