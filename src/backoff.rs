//! Reconnect backoff policy.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`. The base
//! delay is derived purely from the attempt number, so a long outage never
//! grows the delay past the cap and a successful reconnect resets it.
//!
//! ```rust
//! use std::time::Duration;
//! use eventpulse::BackoffPolicy;
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(10),
//!     factor: 2.0,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_millis(100));
//! assert_eq!(backoff.next(1), Duration::from_millis(200));
//! assert_eq!(backoff.next(10), Duration::from_secs(10));
//! ```

use std::time::Duration;

/// Retry backoff policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor; `1.0` gives a fixed delay.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    /// Fixed 5 second delay.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl BackoffPolicy {
    /// A constant delay for every attempt.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
        }
    }

    /// Exponential growth from `first`, capped at `max`.
    #[must_use]
    pub const fn exponential(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
        }
    }

    /// Computes the delay for the given attempt number (0-indexed).
    #[must_use]
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        #[allow(clippy::cast_possible_wrap)]
        let exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped = self.first.as_secs_f64() * self.factor.powi(exp);

        if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped)
        }
    }
}
