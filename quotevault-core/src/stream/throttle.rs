//! Latest-value-wins rate limiter.
//!
//! `offer` emits immediately when at least `interval` has passed since the
//! previous emission (leading edge); otherwise the value is parked, replacing
//! anything parked before it. `flush` releases the parked value only once
//! offers have stopped for a full interval (trailing edge). While values keep
//! arriving, only leading edges fire, so a burst lasting `D` emits at most
//! `ceil(D / interval)` times; the trailing value follows after the burst.
//! Time is passed in so callers and tests control the clock.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    last_emit: Option<Instant>,
    last_offer: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_offer: None,
            pending: None,
        }
    }

    fn elapsed(&self, since: Option<Instant>, now: Instant) -> bool {
        since.map_or(true, |t| now.saturating_duration_since(t) >= self.interval)
    }

    fn ready(&self, now: Instant) -> bool {
        self.elapsed(self.last_emit, now)
    }

    pub fn offer(&mut self, value: T, now: Instant) -> Option<T> {
        self.last_offer = Some(now);
        if self.ready(now) {
            self.last_emit = Some(now);
            self.pending = None;
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    pub fn flush(&mut self, now: Instant) -> Option<T> {
        if self.pending.is_some() && self.ready(now) && self.elapsed(self.last_offer, now) {
            self.last_emit = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    /// Take the parked value regardless of timing (used on shutdown).
    pub fn take_pending(&mut self) -> Option<T> {
        self.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
