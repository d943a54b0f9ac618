//! Backend trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::BackendResult;

use super::key::LimitKey;
use super::registry::BlockRecord;

/// Which backend variant is serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shared counters in the external store
    Distributed,
    /// In-process counters
    Local,
}

impl BackendKind {
    /// Encode for storage in an atomic.
    pub fn as_u8(self) -> u8 {
        match self {
            BackendKind::Distributed => 0,
            BackendKind::Local => 1,
        }
    }

    /// Decode from an atomic. Unknown values read as `Local`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => BackendKind::Distributed,
            _ => BackendKind::Local,
        }
    }

    /// Name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Distributed => "distributed",
            BackendKind::Local => "local",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security summary for an identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecurityInfo {
    pub is_blocked: bool,
    pub block_reason: Option<String>,
    pub block_expiry: Option<DateTime<Utc>>,
    pub is_whitelisted: bool,
    pub violation_count: u64,
    pub last_violation_at: Option<DateTime<Utc>>,
}

/// Operations every rate limit backend provides.
///
/// The coordinator holds one `Arc<dyn RateLimitBackend>` per variant and
/// talks to them only through this trait. Implementations must make each
/// per-key operation atomic with respect to concurrent callers.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// The variant this backend implements.
    fn kind(&self) -> BackendKind;

    /// Count one request against `key` unless the window already holds
    /// `limit` requests. Returns `true` when the request is within limit.
    async fn check_and_increment(&self, key: &LimitKey, limit: u64) -> BackendResult<bool>;

    /// Requests counted in the key's current window.
    async fn current_count(&self, key: &LimitKey) -> BackendResult<u64>;

    /// Clear the key's window.
    async fn reset(&self, key: &LimitKey) -> BackendResult<()>;

    /// Block an identifier for `duration`.
    async fn block(
        &self,
        identifier: &str,
        reason: &str,
        duration: Duration,
    ) -> BackendResult<BlockRecord>;

    /// Lift a block. Returns `true` if an active block was removed.
    async fn unblock(&self, identifier: &str) -> BackendResult<bool>;

    /// The identifier's active block, if any.
    async fn active_block(&self, identifier: &str) -> BackendResult<Option<BlockRecord>>;

    /// Exempt an identifier from every check.
    async fn add_to_whitelist(&self, identifier: &str) -> BackendResult<()>;

    /// Remove an exemption.
    async fn remove_from_whitelist(&self, identifier: &str) -> BackendResult<()>;

    /// Whether the identifier is exempt.
    async fn is_whitelisted(&self, identifier: &str) -> BackendResult<bool>;

    /// Record a violation and return the count inside the violation window.
    async fn record_violation(&self, identifier: &str) -> BackendResult<u64>;

    /// Block, whitelist and violation state for an identifier.
    async fn security_info(&self, identifier: &str) -> BackendResult<SecurityInfo>;

    /// Lightweight liveness check.
    async fn health_check(&self) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_round_trips_through_u8() {
        for kind in [BackendKind::Distributed, BackendKind::Local] {
            assert_eq!(BackendKind::from_u8(kind.as_u8()), kind);
        }
        assert_eq!(BackendKind::from_u8(42), BackendKind::Local);
    }

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(BackendKind::Distributed.to_string(), "distributed");
        assert_eq!(BackendKind::Local.to_string(), "local");
    }
}
