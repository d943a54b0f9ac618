//! Fixed-window request counter.

use chrono::{DateTime, Duration, Utc};

/// Length of a rate limit window.
pub const WINDOW_SECS: i64 = 60;

/// The rate limit window as a `chrono::Duration`.
pub fn window_duration() -> Duration {
    Duration::seconds(WINDOW_SECS)
}

/// A request counter for one identifier+action pair.
///
/// The counter holds no lock of its own; the owning map serializes access
/// so that check-and-increment runs as one unit per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCounter {
    /// Requests counted in the current window
    count: u64,
    /// When the current window started
    window_start: DateTime<Utc>,
    /// Length of the window
    window: Duration,
}

impl WindowCounter {
    /// Create an empty counter whose window starts at `now`.
    pub fn new(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            window,
        }
    }

    /// Count one request if the window still has room.
    ///
    /// Returns `true` if the request is within the limit, `false` if the
    /// window is already full. A full window is not incremented.
    pub fn try_increment(&mut self, limit: u64, now: DateTime<Utc>) -> bool {
        self.maybe_reset_window(now);

        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }

    /// Get the count, treating an expired window as empty.
    pub fn current_count(&self, now: DateTime<Utc>) -> u64 {
        if self.is_expired(now) {
            0
        } else {
            self.count
        }
    }

    /// When the current window ends.
    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + self.window
    }

    /// Whether the window has ended.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end()
    }

    /// Whether the window ended more than `grace` ago.
    pub fn is_stale(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now >= self.window_end() + grace
    }

    /// Start a fresh window if the current one has expired.
    fn maybe_reset_window(&mut self, now: DateTime<Utc>) {
        if self.is_expired(now) {
            self.count = 0;
            self.window_start = now;
        }
    }
}
