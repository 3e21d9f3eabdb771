//! Usage-based rate limiting
//!
//! Each rate-limited model gets a fixed window per user. The window starts
//! with the first request and resets once it has fully elapsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Request allowance for one model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsagePolicy {
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
}

/// Persisted usage counter for one user and model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWindow {
    /// When the current window began
    pub started_at: DateTime<Utc>,
    /// Requests dispatched in the current window
    pub count: u32,
}

impl UsageWindow {
    /// A fresh window starting at `now`
    #[must_use]
    pub const fn start(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            count: 0,
        }
    }
}

impl UsagePolicy {
    /// Create a policy
    #[must_use]
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    fn elapsed(usage: &UsageWindow, now: DateTime<Utc>) -> Duration {
        // A clock that went backwards counts as no time elapsed
        (now - usage.started_at).to_std().unwrap_or_default()
    }

    fn is_expired(&self, usage: &UsageWindow, now: DateTime<Utc>) -> bool {
        Self::elapsed(usage, now) >= self.window
    }

    /// Count one request against the window.
    ///
    /// Returns the number of requests left on success, or the time until
    /// the window resets when the allowance is used up.
    ///
    /// # Errors
    ///
    /// Returns the wait duration if no requests are left in the current window.
    pub fn try_acquire(&self, usage: &mut UsageWindow, now: DateTime<Utc>) -> Result<u32, Duration> {
        if self.is_expired(usage, now) {
            *usage = UsageWindow::start(now);
        }

        if usage.count >= self.max_requests {
            return Err(self.window.saturating_sub(Self::elapsed(usage, now)));
        }

        usage.count += 1;
        Ok(self.max_requests - usage.count)
    }

    /// Requests used in the current window, zero if it has expired
    #[must_use]
    pub fn used(&self, usage: &UsageWindow, now: DateTime<Utc>) -> u32 {
        if self.is_expired(usage, now) {
            0
        } else {
            usage.count
        }
    }

    /// Time until the window resets, `None` if it already has
    #[must_use]
    pub fn resets_in(&self, usage: &UsageWindow, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_expired(usage, now) {
            None
        } else {
            Some(self.window.saturating_sub(Self::elapsed(usage, now)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0)
            .single()
            .unwrap_or_default()
    }

    #[test]
    fn test_allows_up_to_max_then_blocks() {
        let policy = UsagePolicy::new(2, Duration::from_secs(60));
        let mut usage = UsageWindow::start(at(0));

        assert_eq!(policy.try_acquire(&mut usage, at(1)), Ok(1));
        assert_eq!(policy.try_acquire(&mut usage, at(2)), Ok(0));
        assert_eq!(
            policy.try_acquire(&mut usage, at(10)),
            Err(Duration::from_secs(50))
        );
        assert_eq!(usage.count, 2);
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let policy = UsagePolicy::new(1, Duration::from_secs(60));
        let mut usage = UsageWindow::start(at(0));

        assert!(policy.try_acquire(&mut usage, at(0)).is_ok());
        assert!(policy.try_acquire(&mut usage, at(59)).is_err());
        assert_eq!(policy.try_acquire(&mut usage, at(60)), Ok(0));
        assert_eq!(usage.started_at, at(60));
    }

    #[test]
    fn test_status_helpers() {
        let policy = UsagePolicy::new(5, Duration::from_secs(100));
        let usage = UsageWindow {
            started_at: at(0),
            count: 3,
        };

        assert_eq!(policy.used(&usage, at(40)), 3);
        assert_eq!(policy.resets_in(&usage, at(40)), Some(Duration::from_secs(60)));
        assert_eq!(policy.used(&usage, at(100)), 0);
        assert_eq!(policy.resets_in(&usage, at(100)), None);
    }

    #[test]
    fn test_clock_skew_does_not_reset() {
        let policy = UsagePolicy::new(1, Duration::from_secs(60));
        let mut usage = UsageWindow {
            started_at: at(30),
            count: 1,
        };

        assert_eq!(
            policy.try_acquire(&mut usage, at(0)),
            Err(Duration::from_secs(60))
        );
    }
}
