//! Rolling per-identifier violation history.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Minute bucket index (minutes since the Unix epoch).
pub fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

/// Violation history for one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationRecord {
    /// Violations per minute bucket, pruned to the violation window
    pub per_minute_counts: BTreeMap<i64, u64>,
    /// Violations ever recorded for this identifier
    pub total_count: u64,
    /// Time of the latest violation
    pub last_violation_at: DateTime<Utc>,
}

impl ViolationRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            per_minute_counts: BTreeMap::new(),
            total_count: 0,
            last_violation_at: now,
        }
    }

    fn prune(&mut self, cutoff_bucket: i64) {
        self.per_minute_counts = self.per_minute_counts.split_off(&cutoff_bucket);
    }

    /// Sum of all buckets at or after the minute containing `window_start`.
    pub fn count_since(&self, window_start: DateTime<Utc>) -> u64 {
        self.per_minute_counts
            .range(minute_bucket(window_start)..)
            .map(|(_, count)| count)
            .sum()
    }
}

/// Totals reported for an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationSummary {
    /// Violations ever recorded
    pub total_count: u64,
    /// Latest violation, if any
    pub last_violation_at: Option<DateTime<Utc>>,
}

/// Tracks rate limit violations per identifier, bucketed by minute.
pub struct ViolationTracker {
    records: DashMap<String, ViolationRecord>,
    window: Duration,
}

impl ViolationTracker {
    /// Create a tracker that retains `window` worth of buckets.
    pub fn new(window: Duration) -> Self {
        Self {
            records: DashMap::new(),
            window,
        }
    }

    /// Record one violation and return the count inside the window.
    ///
    /// Append, prune and count happen under the identifier's entry lock.
    pub fn record_violation(&self, identifier: &str, now: DateTime<Utc>) -> u64 {
        let mut record = self
            .records
            .entry(identifier.to_string())
            .or_insert_with(|| ViolationRecord::new(now));

        *record.per_minute_counts.entry(minute_bucket(now)).or_insert(0) += 1;
        record.total_count += 1;
        record.last_violation_at = now;

        let window_start = now - self.window;
        record.prune(minute_bucket(window_start));
        record.count_since(window_start)
    }

    /// Violations recorded at or after `window_start`.
    pub fn count_in_window(&self, identifier: &str, window_start: DateTime<Utc>) -> u64 {
        self.records
            .get(identifier)
            .map(|record| record.count_since(window_start))
            .unwrap_or(0)
    }

    /// Whether the identifier reached `threshold` violations in the last
    /// `window_minutes`.
    pub fn should_auto_block(
        &self,
        identifier: &str,
        threshold: u64,
        window_minutes: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let window_start = now - crate::config::minutes(window_minutes);
        self.count_in_window(identifier, window_start) >= threshold
    }

    /// Total and latest violation for an identifier.
    pub fn summary(&self, identifier: &str) -> ViolationSummary {
        match self.records.get(identifier) {
            Some(record) => ViolationSummary {
                total_count: record.total_count,
                last_violation_at: Some(record.last_violation_at),
            },
            None => ViolationSummary {
                total_count: 0,
                last_violation_at: None,
            },
        }
    }

    /// Forget an identifier's history.
    pub fn remove(&self, identifier: &str) {
        self.records.remove(identifier);
    }

    /// Drop identifiers whose last violation left the window.
    pub fn purge_stale(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        let cutoff = now - self.window;
        self.records
            .retain(|_, record| record.last_violation_at >= cutoff);
        before.saturating_sub(self.records.len())
    }

    /// Number of tracked identifiers.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no identifier is tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
