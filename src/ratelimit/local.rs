//! In-process rate limit backend.

use async_trait::async_trait;
use chrono::Duration;
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::clock::SharedClock;
use crate::error::BackendResult;

use super::backend::{BackendKind, RateLimitBackend, SecurityInfo};
use super::counter::{window_duration, WindowCounter};
use super::key::LimitKey;
use super::registry::{BlockRecord, BlockRegistry, WhitelistRegistry};
use super::violations::ViolationTracker;

/// The in-memory backend that serves requests when the distributed store
/// is unavailable.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Every operation is a map access scoped to one shard lock; nothing here
/// performs I/O.
pub struct LocalBackend {
    /// Window counters indexed by identifier+action
    counters: DashMap<LimitKey, WindowCounter>,
    /// Active and not yet reaped blocks
    blocks: BlockRegistry,
    /// Exempt identifiers
    whitelist: WhitelistRegistry,
    /// Violation history
    violations: ViolationTracker,
    clock: SharedClock,
}

impl LocalBackend {
    /// Create a backend with the given violation window.
    pub fn new(clock: SharedClock, violation_window: Duration) -> Self {
        Self {
            counters: DashMap::new(),
            blocks: BlockRegistry::new(),
            whitelist: WhitelistRegistry::new(),
            violations: ViolationTracker::new(violation_window),
            clock,
        }
    }

    /// Count a request for `key` unless its window is full.
    ///
    /// The entry guard holds the shard lock for the whole
    /// read-reset-compare-increment sequence.
    pub fn check_and_increment(&self, key: &LimitKey, limit: u64) -> bool {
        let now = self.clock.now();
        let mut counter = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(key = %key, limit = limit, "Creating new window counter");
                WindowCounter::new(now, window_duration())
            });

        let within_limit = counter.try_increment(limit, now);
        trace!(
            key = %key,
            count = counter.current_count(now),
            limit = limit,
            within_limit = within_limit,
            "Local rate limit check"
        );
        within_limit
    }

    /// Get the current counter value for a key.
    pub fn current_count(&self, key: &LimitKey) -> u64 {
        let now = self.clock.now();
        self.counters
            .get(key)
            .map(|c| c.current_count(now))
            .unwrap_or(0)
    }

    /// Forget a key's window.
    pub fn reset(&self, key: &LimitKey) {
        if self.counters.remove(key).is_some() {
            info!(key = %key, "Rate limit reset (local)");
        }
    }

    /// Block an identifier and start its violation history afresh.
    ///
    /// Window counters are left to expire on their own so a check already
    /// past the block lookup still counts against a full window.
    pub fn block(&self, identifier: &str, reason: &str, duration: Duration) -> BlockRecord {
        let record = BlockRecord::new(identifier, reason, duration, self.clock.now());
        self.blocks.insert(record.clone());
        self.violations.remove(identifier);

        warn!(
            identifier = %identifier,
            reason = %reason,
            expires_at = %record.expires_at,
            "Identifier blocked (local)"
        );
        record
    }

    /// Lift a block. Returns `true` if an active block was removed.
    pub fn unblock(&self, identifier: &str) -> bool {
        let removed = self.blocks.remove(identifier, self.clock.now()).is_some();
        if removed {
            info!(identifier = %identifier, "Identifier unblocked (local)");
        }
        removed
    }

    /// The identifier's active block, if any.
    pub fn active_block(&self, identifier: &str) -> Option<BlockRecord> {
        self.blocks.get_active(identifier, self.clock.now())
    }

    /// Exempt an identifier.
    pub fn add_to_whitelist(&self, identifier: &str) {
        if self.whitelist.add(identifier) {
            info!(identifier = %identifier, "Identifier whitelisted (local)");
        }
    }

    /// Remove an exemption.
    pub fn remove_from_whitelist(&self, identifier: &str) {
        if self.whitelist.remove(identifier) {
            info!(identifier = %identifier, "Identifier removed from whitelist (local)");
        }
    }

    /// Whether the identifier is exempt.
    pub fn is_whitelisted(&self, identifier: &str) -> bool {
        self.whitelist.contains(identifier)
    }

    /// Record a violation and return the in-window count.
    pub fn record_violation(&self, identifier: &str) -> u64 {
        self.violations.record_violation(identifier, self.clock.now())
    }

    /// Build the security summary for an identifier.
    pub fn security_info(&self, identifier: &str) -> SecurityInfo {
        let block = self.active_block(identifier);
        let violations = self.violations.summary(identifier);

        SecurityInfo {
            is_blocked: block.is_some(),
            block_reason: block.as_ref().map(|b| b.reason.clone()),
            block_expiry: block.as_ref().map(|b| b.expires_at),
            is_whitelisted: self.is_whitelisted(identifier),
            violation_count: violations.total_count,
            last_violation_at: violations.last_violation_at,
        }
    }

    /// Remove counters whose window ended more than `retention` ago, along
    /// with violation histories that left their window.
    pub fn reap_counters(&self, retention: Duration) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_stale(now, retention));
        let removed = before.saturating_sub(self.counters.len());
        let stale_violations = self.violations.purge_stale(now);

        if removed > 0 || stale_violations > 0 {
            debug!(
                counters = removed,
                violation_records = stale_violations,
                "Reaped stale local state"
            );
        }
        removed
    }

    /// Remove expired blocks.
    pub fn reap_blocks(&self) -> usize {
        let removed = self.blocks.purge_expired(self.clock.now());
        if removed > 0 {
            debug!(blocks = removed, "Reaped expired blocks");
        }
        removed
    }

    /// Shrink the counter map after a failover if it exceeds `limit`.
    ///
    /// Expired windows go first; if that is not enough every counter is
    /// dropped. Blocks and whitelist entries are kept.
    pub fn enforce_cache_limit(&self, limit: usize) {
        if self.counters.len() <= limit {
            return;
        }

        let before = self.counters.len();
        self.reap_counters(Duration::zero());
        if self.counters.len() > limit {
            self.clear_counters();
        }
        info!(
            before = before,
            after = self.counters.len(),
            limit = limit,
            "Local counter cache cleaned up"
        );
    }

    /// Get the number of live counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Drop every window counter.
    pub fn clear_counters(&self) {
        self.counters.clear();
    }
}

#[async_trait]
impl RateLimitBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn check_and_increment(&self, key: &LimitKey, limit: u64) -> BackendResult<bool> {
        Ok(LocalBackend::check_and_increment(self, key, limit))
    }

    async fn current_count(&self, key: &LimitKey) -> BackendResult<u64> {
        Ok(LocalBackend::current_count(self, key))
    }

    async fn reset(&self, key: &LimitKey) -> BackendResult<()> {
        LocalBackend::reset(self, key);
        Ok(())
    }

    async fn block(
        &self,
        identifier: &str,
        reason: &str,
        duration: Duration,
    ) -> BackendResult<BlockRecord> {
        Ok(LocalBackend::block(self, identifier, reason, duration))
    }

    async fn unblock(&self, identifier: &str) -> BackendResult<bool> {
        Ok(LocalBackend::unblock(self, identifier))
    }

    async fn active_block(&self, identifier: &str) -> BackendResult<Option<BlockRecord>> {
        Ok(LocalBackend::active_block(self, identifier))
    }

    async fn add_to_whitelist(&self, identifier: &str) -> BackendResult<()> {
        LocalBackend::add_to_whitelist(self, identifier);
        Ok(())
    }

    async fn remove_from_whitelist(&self, identifier: &str) -> BackendResult<()> {
        LocalBackend::remove_from_whitelist(self, identifier);
        Ok(())
    }

    async fn is_whitelisted(&self, identifier: &str) -> BackendResult<bool> {
        Ok(LocalBackend::is_whitelisted(self, identifier))
    }

    async fn record_violation(&self, identifier: &str) -> BackendResult<u64> {
        Ok(LocalBackend::record_violation(self, identifier))
    }

    async fn security_info(&self, identifier: &str) -> BackendResult<SecurityInfo> {
        Ok(LocalBackend::security_info(self, identifier))
    }

    async fn health_check(&self) -> BackendResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("counters", &self.counters.len())
            .field("blocks", &self.blocks.len())
            .field("whitelist", &self.whitelist.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn backend() -> (LocalBackend, ManualClock) {
        let clock = ManualClock::starting_now();
        let backend = LocalBackend::new(Arc::new(clock.clone()), Duration::minutes(60));
        (backend, clock)
    }

    #[test]
    fn test_check_and_increment_until_limit() {
        let (backend, _) = backend();
        let key = LimitKey::new("10.0.0.1", "login");

        for _ in 0..3 {
            assert!(backend.check_and_increment(&key, 3));
        }
        assert!(!backend.check_and_increment(&key, 3));
        assert_eq!(backend.current_count(&key), 3);
        assert_eq!(backend.counter_count(), 1);
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let (backend, clock) = backend();
        let key = LimitKey::new("10.0.0.1", "login");

        for _ in 0..3 {
            backend.check_and_increment(&key, 3);
        }
        assert!(!backend.check_and_increment(&key, 3));

        clock.advance(Duration::seconds(60));
        assert_eq!(backend.current_count(&key), 0);
        assert!(backend.check_and_increment(&key, 3));
    }

    #[test]
    fn test_reset_clears_window() {
        let (backend, _) = backend();
        let key = LimitKey::new("alice", "join");

        backend.check_and_increment(&key, 1);
        assert!(!backend.check_and_increment(&key, 1));

        backend.reset(&key);
        assert_eq!(backend.current_count(&key), 0);
        assert!(backend.check_and_increment(&key, 1));
    }

    #[test]
    fn test_block_clears_violations_but_keeps_window() {
        let (backend, _) = backend();
        let login = LimitKey::new("mallory", "login");

        backend.check_and_increment(&login, 10);
        backend.record_violation("mallory");

        let record = backend.block("mallory", "manual", Duration::minutes(30));
        assert_eq!(record.reason, "manual");
        assert_eq!(backend.current_count(&login), 1);

        let info = backend.security_info("mallory");
        assert!(info.is_blocked);
        assert_eq!(info.block_reason.as_deref(), Some("manual"));
        assert_eq!(info.block_expiry, Some(record.expires_at));
        assert_eq!(info.violation_count, 0);
    }

    #[test]
    fn test_block_expires_and_unblock() {
        let (backend, clock) = backend();

        backend.block("a", "manual", Duration::minutes(1));
        backend.block("b", "manual", Duration::minutes(1));
        assert!(backend.unblock("a"));
        assert!(backend.active_block("a").is_none());

        clock.advance(Duration::minutes(1));
        assert!(backend.active_block("b").is_none());
        assert!(!backend.unblock("b"));
    }

    #[test]
    fn test_reapers_only_remove_expired_state() {
        let (backend, clock) = backend();
        let old = LimitKey::new("old", "login");
        let fresh = LimitKey::new("fresh", "login");

        backend.check_and_increment(&old, 10);
        backend.block("blocked-short", "r", Duration::minutes(2));
        backend.block("blocked-long", "r", Duration::minutes(30));

        clock.advance(Duration::minutes(7));
        backend.check_and_increment(&fresh, 10);

        assert_eq!(backend.reap_counters(Duration::minutes(5)), 1);
        assert_eq!(backend.current_count(&fresh), 1);
        assert_eq!(backend.reap_blocks(), 1);
        assert!(backend.active_block("blocked-long").is_some());
    }

    #[test]
    fn test_enforce_cache_limit() {
        let (backend, clock) = backend();
        for i in 0..5 {
            backend.check_and_increment(&LimitKey::new(&format!("id-{}", i), "login"), 10);
        }

        backend.enforce_cache_limit(10);
        assert_eq!(backend.counter_count(), 5);

        // Expired windows are enough to get under the limit
        clock.advance(Duration::seconds(61));
        backend.check_and_increment(&LimitKey::new("live", "login"), 10);
        backend.enforce_cache_limit(2);
        assert_eq!(backend.counter_count(), 1);

        // Live windows above the limit are dropped outright
        backend.check_and_increment(&LimitKey::new("live-2", "login"), 10);
        backend.check_and_increment(&LimitKey::new("live-3", "login"), 10);
        backend.enforce_cache_limit(2);
        assert_eq!(backend.counter_count(), 0);
    }

    #[test]
    fn test_whitelist_is_reported_in_security_info() {
        let (backend, _) = backend();
        backend.add_to_whitelist("trusted");

        let info = backend.security_info("trusted");
        assert!(info.is_whitelisted);
        assert!(!info.is_blocked);

        backend.remove_from_whitelist("trusted");
        assert!(!backend.is_whitelisted("trusted"));
    }

    #[test]
    fn test_concurrent_increments_never_exceed_limit() {
        let (backend, _) = backend();
        let backend = Arc::new(backend);
        let key = LimitKey::new("10.0.0.1", "login");
        let limit = 50;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let backend = backend.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .filter(|_| backend.check_and_increment(&key, limit))
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, limit as usize);
        assert_eq!(backend.current_count(&key), limit);
    }

    #[test]
    fn test_trait_dispatch_never_fails() {
        let (backend, _) = backend();
        let backend: Arc<dyn RateLimitBackend> = Arc::new(backend);
        let key = LimitKey::new("10.0.0.1", "login");

        tokio_test::block_on(async {
            assert_eq!(backend.kind(), BackendKind::Local);
            assert!(backend.check_and_increment(&key, 1).await.unwrap());
            assert!(!backend.check_and_increment(&key, 1).await.unwrap());
            assert_eq!(backend.record_violation("10.0.0.1").await.unwrap(), 1);
            assert!(backend.health_check().await.is_ok());
        });
    }
}
