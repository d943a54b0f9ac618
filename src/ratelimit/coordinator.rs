//! Backend selection, failover and the public rate limiting contract.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::clock::SharedClock;
use crate::config::{self, LimitsConfig, WardenConfig};
use crate::error::{BackendError, BackendResult, Result};

use super::backend::{BackendKind, RateLimitBackend, SecurityInfo};
use super::decision::RateLimitDecision;
use super::distributed::DistributedBackend;
use super::key::LimitKey;
use super::local::LocalBackend;
use super::registry::BlockRecord;

/// Failed distributed calls in a row that trigger a switch to local.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Reason recorded on blocks placed by the violation threshold.
pub const AUTO_BLOCK_REASON: &str = "auto-block: violation threshold exceeded";

const STARTUP_UNAVAILABLE_REASON: &str = "distributed backend unavailable at startup";
const RECOVERED_REASON: &str = "distributed backend recovered";

/// Snapshot of backend selection for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealthState {
    pub active_backend: BackendKind,
    pub consecutive_failures: u32,
    pub last_switch_reason: Option<String>,
    pub last_switch_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct SwitchEvent {
    reason: String,
    at: DateTime<Utc>,
}

/// Routes every rate limiting operation to the active backend.
///
/// The distributed backend serves requests until it fails
/// `MAX_CONSECUTIVE_FAILURES` times in a row; from then on the local backend
/// serves everything until a health probe succeeds. A failed distributed call
/// is always re-run locally, so infrastructure errors never reach callers.
pub struct RateLimitCoordinator {
    limits: LimitsConfig,
    local: Arc<LocalBackend>,
    distributed: Option<Arc<dyn RateLimitBackend>>,
    /// `BackendKind` encoded with `as_u8`
    active: AtomicU8,
    consecutive_failures: AtomicU32,
    last_switch: Mutex<Option<SwitchEvent>>,
    clock: SharedClock,
}

impl RateLimitCoordinator {
    /// Create a coordinator. It starts on the distributed backend when one
    /// is given, otherwise on the local backend.
    pub fn new(
        limits: LimitsConfig,
        clock: SharedClock,
        distributed: Option<Arc<dyn RateLimitBackend>>,
    ) -> Self {
        let local = Arc::new(LocalBackend::new(clock.clone(), limits.violation_window()));
        let active = if distributed.is_some() {
            BackendKind::Distributed
        } else {
            BackendKind::Local
        };

        Self {
            limits,
            local,
            distributed,
            active: AtomicU8::new(active.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            last_switch: Mutex::new(None),
            clock,
        }
    }

    /// Build a coordinator from configuration.
    ///
    /// When Redis is enabled the coordinator only starts on it if a health
    /// check passes; otherwise it starts on the local backend and the health
    /// probe takes over from there.
    pub async fn initialize(config: &WardenConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;

        let distributed: Option<Arc<dyn RateLimitBackend>> = if config.redis.enabled {
            let backend: Arc<dyn RateLimitBackend> = Arc::new(DistributedBackend::new(
                &config.redis,
                clock.clone(),
                config.limits.violation_window(),
            )?);
            Some(backend)
        } else {
            info!("Distributed backend disabled, using local backend");
            None
        };

        let coordinator = Self::new(config.limits.clone(), clock, distributed);
        if let Some(distributed) = &coordinator.distributed {
            match distributed.health_check().await {
                Ok(()) => info!("Distributed backend reachable"),
                Err(e) => {
                    warn!(error = %e, "Distributed backend unreachable at startup");
                    coordinator.switch_to_local(STARTUP_UNAVAILABLE_REASON);
                }
            }
        }

        info!(
            backend = %coordinator.active_backend(),
            requests_per_minute = coordinator.limits.requests_per_minute,
            max_violations = coordinator.limits.max_violations_before_block,
            "Rate limit coordinator initialized"
        );
        Ok(coordinator)
    }

    /// Decide whether `identifier` may perform `action` now.
    ///
    /// Whitelisted identifiers are always allowed and never counted. Blocked
    /// identifiers are rejected without counting. Otherwise the request is
    /// counted; a full window records a violation and may auto-block.
    pub async fn check_rate_limit(&self, identifier: &str, action: &str) -> RateLimitDecision {
        if self.is_whitelisted(identifier).await {
            trace!(identifier, action, "Whitelisted, skipping rate limit");
            return RateLimitDecision::Allowed;
        }

        if let Some(block) = self.active_block(identifier).await {
            debug!(
                identifier,
                action,
                reason = %block.reason,
                remaining_secs = block.remaining(self.clock.now()).num_seconds(),
                "Rejected blocked identifier"
            );
            return RateLimitDecision::Blocked {
                reason: block.reason,
                expires_at: block.expires_at,
            };
        }

        let key = LimitKey::new(identifier, action);
        let limit = self.limits.requests_per_minute;
        let (allowed, counted_by) = self.count_request(&key, limit).await;
        if allowed {
            trace!(key = %key, limit = limit, backend = %counted_by.kind(), "Request allowed");
            return RateLimitDecision::Allowed;
        }

        self.handle_violation(&key, counted_by).await;
        RateLimitDecision::LimitExceeded
    }

    /// Requests counted in the current window for `identifier` and `action`.
    pub async fn get_current_count(&self, identifier: &str, action: &str) -> u64 {
        let key = &LimitKey::new(identifier, action);
        self.with_backend("current_count", |backend| async move {
            backend.current_count(key).await
        })
        .await
    }

    /// Clear the window for `identifier` and `action`.
    pub async fn reset_limit(&self, identifier: &str, action: &str) {
        let key = &LimitKey::new(identifier, action);
        self.with_backend("reset", |backend| async move { backend.reset(key).await })
            .await;
        debug!(key = %key, "Rate limit reset");
    }

    /// Block `identifier` for `duration_minutes`, at most
    /// `MAX_DURATION_MINUTES`.
    pub async fn block_identifier(
        &self,
        identifier: &str,
        reason: &str,
        duration_minutes: u64,
    ) -> BlockRecord {
        let duration = config::minutes(duration_minutes);

        if let Some(distributed) = self.distributed_if_active() {
            match distributed.block(identifier, reason, duration).await {
                Ok(record) => {
                    self.record_success();
                    return record;
                }
                Err(e) => self.record_failure("block", &e),
            }
        }

        self.local.block(identifier, reason, duration)
    }

    /// Lift a block. Returns `true` if an active block was removed.
    pub async fn unblock_identifier(&self, identifier: &str) -> bool {
        self.with_backend("unblock", |backend| async move {
            backend.unblock(identifier).await
        })
        .await
    }

    /// Exempt `identifier` from every check.
    pub async fn add_to_whitelist(&self, identifier: &str) {
        self.with_backend("add_to_whitelist", |backend| async move {
            backend.add_to_whitelist(identifier).await
        })
        .await
    }

    /// Remove an exemption.
    pub async fn remove_from_whitelist(&self, identifier: &str) {
        self.with_backend("remove_from_whitelist", |backend| async move {
            backend.remove_from_whitelist(identifier).await
        })
        .await
    }

    pub async fn is_whitelisted(&self, identifier: &str) -> bool {
        self.with_backend("is_whitelisted", |backend| async move {
            backend.is_whitelisted(identifier).await
        })
        .await
    }

    pub async fn is_blocked(&self, identifier: &str) -> bool {
        self.active_block(identifier).await.is_some()
    }

    /// Block, whitelist and violation state for `identifier`.
    pub async fn get_security_info(&self, identifier: &str) -> SecurityInfo {
        self.with_backend("security_info", |backend| async move {
            backend.security_info(identifier).await
        })
        .await
    }

    /// Try to return to the distributed backend.
    ///
    /// Only acts while the local backend is active. Returns `true` if this
    /// call switched back. Counters are not migrated between backends.
    pub async fn probe_distributed(&self) -> bool {
        let Some(distributed) = self.distributed.as_ref() else {
            return false;
        };
        if self.active_backend() == BackendKind::Distributed {
            return false;
        }

        if let Err(e) = distributed.health_check().await {
            debug!(error = %e, "Distributed backend still unavailable");
            return false;
        }

        let switched = self
            .active
            .compare_exchange(
                BackendKind::Local.as_u8(),
                BackendKind::Distributed.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if switched {
            self.consecutive_failures.store(0, Ordering::Release);
            *self.last_switch.lock() = Some(SwitchEvent {
                reason: RECOVERED_REASON.to_string(),
                at: self.clock.now(),
            });
            info!("Distributed backend recovered, switched back from local backend");
        }
        switched
    }

    pub fn active_backend(&self) -> BackendKind {
        BackendKind::from_u8(self.active.load(Ordering::Acquire))
    }

    /// Whether the distributed backend is the selected backend.
    ///
    /// This reads the current selection only; live reachability is what
    /// `probe_distributed` checks.
    pub fn is_distributed_available(&self) -> bool {
        self.active_backend() == BackendKind::Distributed
    }

    /// Whether a distributed backend is configured at all.
    pub fn has_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn health_state(&self) -> BackendHealthState {
        let last_switch = self.last_switch.lock().clone();
        BackendHealthState {
            active_backend: self.active_backend(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            last_switch_reason: last_switch.as_ref().map(|event| event.reason.clone()),
            last_switch_at: last_switch.map(|event| event.at),
        }
    }

    /// The local backend, for maintenance tasks.
    pub fn local(&self) -> &Arc<LocalBackend> {
        &self.local
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    async fn active_block(&self, identifier: &str) -> Option<BlockRecord> {
        self.with_backend("active_block", |backend| async move {
            backend.active_block(identifier).await
        })
        .await
    }

    /// Count a request, returning the verdict and the backend that counted it.
    async fn count_request(
        &self,
        key: &LimitKey,
        limit: u64,
    ) -> (bool, Arc<dyn RateLimitBackend>) {
        if let Some(distributed) = self.distributed_if_active() {
            match distributed.check_and_increment(key, limit).await {
                Ok(allowed) => {
                    self.record_success();
                    return (allowed, distributed);
                }
                Err(e) => self.record_failure("check_and_increment", &e),
            }
        }
        (self.local.check_and_increment(key, limit), self.local_backend())
    }

    /// Record a violation on the backend that counted the request and
    /// auto-block once the threshold is reached.
    async fn handle_violation(&self, key: &LimitKey, counted_by: Arc<dyn RateLimitBackend>) {
        let identifier = key.identifier.as_str();
        let violations = match counted_by.record_violation(identifier).await {
            Ok(count) => {
                if counted_by.kind() == BackendKind::Distributed {
                    self.record_success();
                }
                count
            }
            Err(e) => {
                self.record_failure("record_violation", &e);
                self.local.record_violation(identifier)
            }
        };

        let threshold = self.limits.max_violations_before_block;
        warn!(
            key = %key,
            violations = violations,
            threshold = threshold,
            "Rate limit exceeded"
        );

        if violations >= threshold {
            let record = self
                .block_identifier(identifier, AUTO_BLOCK_REASON, self.limits.block_duration_minutes)
                .await;
            warn!(
                identifier,
                violations = violations,
                expires_at = %record.expires_at,
                "Identifier auto-blocked"
            );
        }
    }

    /// Run `op` on the active backend, re-running it locally if the
    /// distributed backend fails.
    async fn with_backend<T, F, Fut>(&self, operation: &'static str, op: F) -> T
    where
        T: Default,
        F: Fn(Arc<dyn RateLimitBackend>) -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        if let Some(distributed) = self.distributed_if_active() {
            match op(distributed).await {
                Ok(value) => {
                    self.record_success();
                    return value;
                }
                Err(e) => self.record_failure(operation, &e),
            }
        }

        match op(self.local_backend()).await {
            Ok(value) => value,
            Err(e) => {
                error!(operation, error = %e, "Local backend failed");
                T::default()
            }
        }
    }

    fn distributed_if_active(&self) -> Option<Arc<dyn RateLimitBackend>> {
        match self.active_backend() {
            BackendKind::Distributed => self.distributed.clone(),
            BackendKind::Local => None,
        }
    }

    fn local_backend(&self) -> Arc<dyn RateLimitBackend> {
        self.local.clone()
    }

    fn record_success(&self) {
        if self.consecutive_failures.load(Ordering::Acquire) != 0 {
            self.consecutive_failures.store(0, Ordering::Release);
        }
    }

    fn record_failure(&self, operation: &'static str, err: &BackendError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            operation,
            error = %err,
            consecutive_failures = failures,
            "Distributed backend call failed, serving locally"
        );

        if failures >= MAX_CONSECUTIVE_FAILURES {
            self.switch_to_local(&format!(
                "{} consecutive distributed backend failures, last: {}",
                failures, err
            ));
        }
    }

    /// Switch from distributed to local. Only the caller that wins the
    /// switch records the reason and cleans up the local cache.
    fn switch_to_local(&self, reason: &str) -> bool {
        let switched = self
            .active
            .compare_exchange(
                BackendKind::Distributed.as_u8(),
                BackendKind::Local.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !switched {
            return false;
        }

        *self.last_switch.lock() = Some(SwitchEvent {
            reason: reason.to_string(),
            at: self.clock.now(),
        });
        warn!(reason, "Switched to local backend");
        self.local.enforce_cache_limit(self.limits.memory_cache_limit);
        true
    }
}

impl std::fmt::Debug for RateLimitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitCoordinator")
            .field("active_backend", &self.active_backend())
            .field("has_distributed", &self.has_distributed())
            .field("consecutive_failures", &self.consecutive_failures.load(Ordering::Relaxed))
            .finish()
    }
}
