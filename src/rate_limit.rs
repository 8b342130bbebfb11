//! Fixed-window throttling for login attempts.
//!
//! # Algorithm
//!
//! A single global counter over a fixed, non-sliding window. Every login
//! attempt (valid or invalid) consumes one slot; when the window expires the
//! counter restarts from zero. This is intentionally simpler than per-client
//! token buckets: the gateway protects exactly one shared TOTP secret, so
//! there is exactly one credential for an attacker to brute-force and one
//! legitimate holder to inconvenience.
//!
//! # Semantics
//!
//! - [`LoginRateLimiter::attempt`] checks window expiry *before* evaluating
//!   the current attempt, then applies check-then-increment under a single
//!   lock so concurrent attempts cannot race past the cap.
//! - [`LoginRateLimiter::reset`] clears the counter after a successful login
//!   so earlier failures in the same window do not penalize the legitimate
//!   user.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

/// Mutable window state, guarded by the limiter's mutex.
#[derive(Debug)]
struct WindowState {
    /// Attempts consumed in the current window
    count: u32,
    /// When the current window started
    window_start: Instant,
}

/// Global fixed-window rate limiter for login attempts.
///
/// Cheap to clone; clones share the same window state.
#[derive(Debug, Clone)]
pub struct LoginRateLimiter {
    max_attempts: u32,
    window: Duration,
    state: Arc<Mutex<WindowState>>,
}

impl LoginRateLimiter {
    /// Create a limiter allowing `max_attempts` per `window`.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            state: Arc::new(Mutex::new(WindowState {
                count: 0,
                window_start: Instant::now(),
            })),
        }
    }

    /// Register a login attempt.
    ///
    /// Returns `true` if the attempt may proceed to verification (and counts
    /// it), `false` if the window's budget is exhausted (nothing is counted
    /// and no verification should run).
    pub fn attempt(&self) -> bool {
        let now = Instant::now();
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => {
                // A panic while holding the lock leaves only plain integers
                // behind; the state is still usable.
                warn!("rate limiter lock poisoned, recovering state");
                poisoned.into_inner()
            }
        };

        // Expire the window before judging the attempt.
        if now.duration_since(state.window_start) > self.window {
            state.count = 0;
            state.window_start = now;
        }

        if state.count >= self.max_attempts {
            return false;
        }

        state.count += 1;
        true
    }

    /// Clear the counter and restart the window.
    ///
    /// Called after a successful login so prior failures in the same window
    /// do not lock out the legitimate user.
    pub fn reset(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => {
                warn!("rate limiter lock poisoned, recovering state");
                poisoned.into_inner()
            }
        };
        state.count = 0;
        state.window_start = Instant::now();
    }
}
