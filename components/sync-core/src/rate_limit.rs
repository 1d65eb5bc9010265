/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The rate-limit gate (C3, §4.3): a per-remote minimum-interval spacer
//! sitting between the remote client and the network, with multiplicative
//! backoff on 429 that decays back to the floor on sustained success.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct RateLimitState {
    min_interval: Duration,
    floor: Duration,
    ceiling: Duration,
    next_allowed: Instant,
    consecutive_successes: u32,
}

/// One gate per remote. Cloning is cheap (`Arc`-free by design — callers
/// hold the `RateLimiter` itself behind an `Arc` if they need to share it).
pub struct RateLimiter {
    state: Mutex<RateLimitState>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            state: Mutex::new(RateLimitState {
                min_interval,
                floor: min_interval,
                ceiling: min_interval * 20,
                next_allowed: Instant::now(),
                consecutive_successes: 0,
            }),
        }
    }

    /// Block the calling thread until the next request is permitted. No
    /// lock is held across the sleep (§5: "no mutation holds a lock across
    /// a suspension point").
    pub fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let wait = state.next_allowed.saturating_duration_since(now);
            state.next_allowed = now.max(state.next_allowed) + state.min_interval;
            wait
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }

    /// Call after a successful request: slowly decays spacing back toward
    /// the configured floor once enough consecutive successes accrue.
    pub fn on_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_successes += 1;
        if state.consecutive_successes >= 5 && state.min_interval > state.floor {
            state.consecutive_successes = 0;
            let decayed = Duration::from_secs_f64(state.min_interval.as_secs_f64() * 0.8);
            state.min_interval = decayed.max(state.floor);
        }
    }

    /// Call after a 429: multiplicatively increases spacing, capped at the
    /// configured ceiling.
    pub fn on_rate_limited(&self) {
        let mut state = self.state.lock();
        state.consecutive_successes = 0;
        let grown = Duration::from_secs_f64(state.min_interval.as_secs_f64() * 2.0);
        state.min_interval = grown.min(state.ceiling);
    }

    #[cfg(test)]
    fn current_interval(&self) -> Duration {
        self.state.lock().min_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_spaces_calls_by_min_interval() {
        let gate = RateLimiter::new(Duration::from_millis(20));
        let start = Instant::now();
        gate.acquire();
        gate.acquire();
        gate.acquire();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn rate_limited_grows_then_success_decays() {
        let gate = RateLimiter::new(Duration::from_millis(10));
        gate.on_rate_limited();
        assert_eq!(gate.current_interval(), Duration::from_millis(20));
        for _ in 0..5 {
            gate.on_success();
        }
        assert!(gate.current_interval() < Duration::from_millis(20));
        assert!(gate.current_interval() >= Duration::from_millis(10));
    }

    #[test]
    fn decay_never_drops_below_floor() {
        let gate = RateLimiter::new(Duration::from_millis(10));
        for _ in 0..50 {
            gate.on_success();
        }
        assert_eq!(gate.current_interval(), Duration::from_millis(10));
    }
}
