//! Expiry policy for in-flight requests.
//!
//! An entry written at `t0` with timeout `T` is expired at any instant
//! `now >= t0 + T` and never before. Clock readings are `tokio::time::Instant`
//! so tests can drive time with a paused runtime.

use std::time::Duration;
use tokio::time::Instant;

/// Decides whether an in-flight request has outlived its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutChecker {
    timeout: Duration,
}

impl TimeoutChecker {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True once `timeout` has fully elapsed since `started`.
    #[must_use]
    pub fn is_expired(&self, started: Instant, now: Instant) -> bool {
        is_expired(started, self.timeout, now)
    }

    /// Time left before expiry; zero once expired.
    #[must_use]
    pub fn remaining(&self, started: Instant, now: Instant) -> Duration {
        self.timeout
            .saturating_sub(now.saturating_duration_since(started))
    }

    /// Instant at which an entry started at `started` expires.
    #[must_use]
    pub fn deadline(&self, started: Instant) -> Instant {
        started + self.timeout
    }
}

/// Stateless form of [`TimeoutChecker::is_expired`] for per-entry timeouts.
#[must_use]
pub fn is_expired(started: Instant, timeout: Duration, now: Instant) -> bool {
    now.saturating_duration_since(started) >= timeout
}
