//! Block and whitelist registries.

use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;

/// A temporary block placed on an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockRecord {
    /// The blocked identifier
    pub identifier: String,
    /// Why the identifier was blocked
    pub reason: String,
    /// When the block lapses
    pub expires_at: DateTime<Utc>,
    /// When the block was placed
    pub blocked_at: DateTime<Utc>,
}

impl BlockRecord {
    /// Create a block lasting `duration` from `now`.
    pub fn new(identifier: &str, reason: &str, duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
            expires_at: now + duration,
            blocked_at: now,
        }
    }

    /// A block is active strictly before its expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Time left on the block.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        if self.is_active(now) {
            self.expires_at - now
        } else {
            Duration::zero()
        }
    }
}

/// Identifier → block record, with expiry-aware lookups.
#[derive(Default)]
pub struct BlockRegistry {
    blocks: DashMap<String, BlockRecord>,
}

impl BlockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block, replacing any previous one for the identifier.
    pub fn insert(&self, record: BlockRecord) {
        self.blocks.insert(record.identifier.clone(), record);
    }

    /// Get the active block for an identifier.
    ///
    /// An expired record is evicted and reported as absent.
    pub fn get_active(&self, identifier: &str, now: DateTime<Utc>) -> Option<BlockRecord> {
        let record = self.blocks.get(identifier).map(|r| r.value().clone())?;
        if record.is_active(now) {
            return Some(record);
        }

        self.blocks
            .remove_if(identifier, |_, existing| !existing.is_active(now));
        None
    }

    /// Remove a block. Returns the record if one was active.
    pub fn remove(&self, identifier: &str, now: DateTime<Utc>) -> Option<BlockRecord> {
        self.blocks
            .remove(identifier)
            .map(|(_, record)| record)
            .filter(|record| record.is_active(now))
    }

    /// Drop every expired record and return how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|_, record| record.is_active(now));
        before.saturating_sub(self.blocks.len())
    }

    /// Number of stored records, expired or not.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether no record is stored.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Identifiers exempt from every check.
#[derive(Default)]
pub struct WhitelistRegistry {
    entries: DashSet<String>,
}

impl WhitelistRegistry {
    /// Create an empty whitelist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identifier. Returns `false` if it was already present.
    pub fn add(&self, identifier: &str) -> bool {
        self.entries.insert(identifier.to_string())
    }

    /// Remove an identifier. Returns `false` if it was not present.
    pub fn remove(&self, identifier: &str) -> bool {
        self.entries.remove(identifier).is_some()
    }

    /// Whether the identifier is exempt.
    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains(identifier)
    }

    /// Number of exempt identifiers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the whitelist is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_is_active_until_expiry() {
        let now = Utc::now();
        let registry = BlockRegistry::new();
        registry.insert(BlockRecord::new("10.0.0.1", "manual", Duration::minutes(30), now));

        let record = registry.get_active("10.0.0.1", now).unwrap();
        assert_eq!(record.reason, "manual");
        assert_eq!(record.remaining(now), Duration::minutes(30));

        // Exactly at expiry the block no longer applies
        let expiry = now + Duration::minutes(30);
        assert!(registry.get_active("10.0.0.1", expiry).is_none());
        assert!(registry.is_empty(), "expired record should be evicted on lookup");
    }

    #[test]
    fn test_remove_reports_only_active_blocks() {
        let now = Utc::now();
        let registry = BlockRegistry::new();
        registry.insert(BlockRecord::new("a", "r", Duration::minutes(1), now));
        registry.insert(BlockRecord::new("b", "r", Duration::minutes(1), now));

        assert!(registry.remove("a", now).is_some());
        assert!(registry.remove("a", now).is_none());
        assert!(registry.remove("b", now + Duration::minutes(2)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let now = Utc::now();
        let registry = BlockRegistry::new();
        registry.insert(BlockRecord::new("short", "r", Duration::minutes(1), now));
        registry.insert(BlockRecord::new("long", "r", Duration::minutes(60), now));

        assert_eq!(registry.purge_expired(now + Duration::minutes(5)), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get_active("long", now + Duration::minutes(5)).is_some());
    }

    #[test]
    fn test_whitelist_membership() {
        let whitelist = WhitelistRegistry::new();
        assert!(whitelist.add("trusted"));
        assert!(!whitelist.add("trusted"));
        assert!(whitelist.contains("trusted"));
        assert!(!whitelist.contains("Trusted"));

        assert!(whitelist.remove("trusted"));
        assert!(!whitelist.remove("trusted"));
        assert!(whitelist.is_empty());
    }
}
