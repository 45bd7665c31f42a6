//! Exponential backoff with jitter for upstream session bring-up.
//!
//! `delay_n = min(base * 1.5^(n-1) * (1 + U[0, 0.2]), 60s)`, capped at 10
//! attempts. The counter resets only on a successful explicit `connect()` —
//! it is *not* reset by `fullReconnect()`.

use common::constants::{
    MAX_RECONNECT_ATTEMPTS, RECONNECT_BACKOFF_BASE_SECS, RECONNECT_BACKOFF_CAP_SECS,
    RECONNECT_BACKOFF_FACTOR,
};
use rand::Rng;
use std::time::Duration;

/// Compute `delay_n` for attempt `n` (1-indexed), given a jitter sample in `[0, 1)`.
#[must_use]
pub fn delay_for_attempt(n: u32, jitter_unit: f64) -> Duration {
    debug_assert!((0.0..1.0).contains(&jitter_unit));
    let raw = RECONNECT_BACKOFF_BASE_SECS
        * RECONNECT_BACKOFF_FACTOR.powi(i32::try_from(n.saturating_sub(1)).unwrap_or(i32::MAX))
        * (1.0 + jitter_unit * 0.2);
    Duration::from_secs_f64(raw.min(RECONNECT_BACKOFF_CAP_SECS))
}

/// Tracks the reconnect attempt counter for one upstream session.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    attempts: u32,
}

impl ReconnectBackoff {
    #[must_use]
    pub fn new() -> Self {
        Self { attempts: 0 }
    }

    /// Resets the counter. Called on a successful explicit `connect()`.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Whether the budget (`MAX_RECONNECT_ATTEMPTS`) is exhausted.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.attempts >= MAX_RECONNECT_ATTEMPTS
    }

    /// Records an attempt and returns the delay to wait before it, or `None`
    /// if the budget is already exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        self.attempts += 1;
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        Some(delay_for_attempt(self.attempts, jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let d1 = delay_for_attempt(1, 0.0);
        let d2 = delay_for_attempt(2, 0.0);
        assert_eq!(d1.as_secs_f64(), 5.0);
        assert_eq!(d2.as_secs_f64(), 7.5);
        let d_big = delay_for_attempt(20, 0.0);
        assert_eq!(d_big.as_secs_f64(), 60.0);
    }

    #[test]
    fn jitter_adds_up_to_twenty_percent() {
        let base = delay_for_attempt(1, 0.0).as_secs_f64();
        let jittered = delay_for_attempt(1, 1.0).as_secs_f64();
        assert!((jittered - base * 1.2).abs() < 1e-9);
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut backoff = ReconnectBackoff::new();
        for _ in 0..10 {
            assert!(backoff.next_delay().is_some());
        }
        assert!(backoff.exhausted());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn reset_clears_attempts() {
        let mut backoff = ReconnectBackoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(!backoff.exhausted());
        assert_eq!(backoff.attempts, 0);
    }
}
