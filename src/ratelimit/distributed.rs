//! Distributed rate limit backend using Redis.
//!
//! Every logical operation is one round trip: counters, blocks and
//! violation histories are updated by Lua scripts so concurrent callers on
//! different nodes never lose updates. Each call is bounded by the
//! configured timeout and is not retried here; failures are reported to the
//! coordinator, which decides about failover.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::clock::SharedClock;
use crate::config::RedisConfig;
use crate::error::{BackendError, BackendResult};

use super::backend::{BackendKind, RateLimitBackend, SecurityInfo};
use super::counter::WINDOW_SECS;
use super::key::LimitKey;
use super::registry::BlockRecord;
use super::violations::minute_bucket;

/// Returns the new count, or -1 when the window is already full.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SETEX', KEYS[1], ARGV[2], '1')
  return 1
end
if tonumber(current) >= tonumber(ARGV[1]) then
  return -1
end
return redis.call('INCR', KEYS[1])
"#;

/// KEYS: block hash, violation hash. ARGV: reason, blocked_at ms,
/// expires_at ms, ttl secs.
const BLOCK_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'reason', ARGV[1], 'blocked_at', ARGV[2], 'expires_at', ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[4])
redis.call('DEL', KEYS[2])
return 1
"#;

/// KEYS: violation hash. ARGV: minute bucket, cutoff bucket, now ms,
/// ttl secs. Returns the in-window count.
const VIOLATION_SCRIPT: &str = r#"
local key = KEYS[1]
local cutoff = tonumber(ARGV[2])
redis.call('HINCRBY', key, 'b:' .. ARGV[1], 1)
redis.call('HINCRBY', key, 'total', 1)
redis.call('HSET', key, 'last_at', ARGV[3])
local fields = redis.call('HGETALL', key)
local in_window = 0
for i = 1, #fields, 2 do
  local name = fields[i]
  if string.sub(name, 1, 2) == 'b:' then
    if tonumber(string.sub(name, 3)) < cutoff then
      redis.call('HDEL', key, name)
    else
      in_window = in_window + tonumber(fields[i + 1])
    end
  end
end
redis.call('EXPIRE', key, ARGV[4])
return in_window
"#;

/// Key layout in the store.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    /// Create a layout under `prefix`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Window counter for an identifier+action.
    pub fn counter(&self, key: &LimitKey) -> String {
        key.to_store_key(&self.prefix)
    }

    /// Block hash for an identifier.
    pub fn block(&self, identifier: &str) -> String {
        format!("{}block:{}", self.prefix, identifier)
    }

    /// Whitelist marker for an identifier.
    pub fn whitelist(&self, identifier: &str) -> String {
        format!("{}whitelist:{}", self.prefix, identifier)
    }

    /// Violation hash for an identifier.
    pub fn violations(&self, identifier: &str) -> String {
        format!("{}violations:{}", self.prefix, identifier)
    }
}

struct Scripts {
    increment: Script,
    block: Script,
    violation: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            increment: Script::new(INCREMENT_SCRIPT),
            block: Script::new(BLOCK_SCRIPT),
            violation: Script::new(VIOLATION_SCRIPT),
        }
    }
}

/// A rate limit backend shared by every node through Redis.
pub struct DistributedBackend {
    client: redis::Client,
    /// Lazily established; dropped after a connection-level failure
    connection: Mutex<Option<MultiplexedConnection>>,
    keys: StoreKeys,
    scripts: Scripts,
    timeout: std::time::Duration,
    violation_window: Duration,
    clock: SharedClock,
}

impl DistributedBackend {
    /// Create a backend for the configured Redis endpoint.
    ///
    /// Only the URL is validated here; the connection is opened on first use.
    pub fn new(
        config: &RedisConfig,
        clock: SharedClock,
        violation_window: Duration,
    ) -> BackendResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        info!(
            url = %config.url,
            key_prefix = %config.key_prefix,
            timeout_ms = config.command_timeout_ms,
            "Distributed backend configured"
        );

        Ok(Self {
            client,
            connection: Mutex::new(None),
            keys: StoreKeys::new(&config.key_prefix),
            scripts: Scripts::new(),
            timeout: config.command_timeout(),
            violation_window,
            clock,
        })
    }

    async fn connection(&self) -> BackendResult<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        debug!("Opened Redis connection");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_connection(&self) {
        self.connection.lock().await.take();
    }

    /// Run one round trip under the timeout.
    async fn run<T, F, Fut>(&self, operation: &'static str, f: F) -> BackendResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let attempt = async {
            let conn = self.connection().await?;
            f(conn).await.map_err(BackendError::from)
        };

        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.timeout)),
        };

        if let Err(ref e) = result {
            warn!(operation = operation, error = %e, "Redis operation failed");
            if is_connection_level(e) {
                self.drop_connection().await;
            }
        }
        result
    }
}

/// Whether the error means the connection itself is unusable.
fn is_connection_level(err: &BackendError) -> bool {
    match err {
        BackendError::Timeout(_) | BackendError::Connection(_) => true,
        BackendError::Redis(e) => {
            e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        }
        BackendError::Protocol(_) => false,
    }
}

/// Rebuild a block record from its hash fields.
fn parse_block(identifier: &str, fields: &HashMap<String, String>) -> BackendResult<Option<BlockRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let reason = fields
        .get("reason")
        .cloned()
        .ok_or_else(|| BackendError::Protocol(format!("block for {} has no reason", identifier)))?;
    let blocked_at = parse_millis(fields.get("blocked_at"), "blocked_at")?;
    let expires_at = parse_millis(fields.get("expires_at"), "expires_at")?;

    Ok(Some(BlockRecord {
        identifier: identifier.to_string(),
        reason,
        expires_at,
        blocked_at,
    }))
}

fn parse_millis(value: Option<&String>, field: &str) -> BackendResult<DateTime<Utc>> {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| BackendError::Protocol(format!("invalid {} field", field)))
}

/// Seconds for a TTL, rounded up and never zero.
fn ttl_secs(duration: Duration) -> i64 {
    let millis = duration.num_milliseconds().max(1);
    (millis + 999) / 1000
}

#[async_trait]
impl RateLimitBackend for DistributedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }

    async fn check_and_increment(&self, key: &LimitKey, limit: u64) -> BackendResult<bool> {
        let redis_key = self.keys.counter(key);
        let script = &self.scripts.increment;

        let result: i64 = self
            .run("check_and_increment", |mut conn| async move {
                script
                    .key(&redis_key)
                    .arg(limit)
                    .arg(WINDOW_SECS)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        trace!(key = %key, result = result, limit = limit, "Distributed rate limit check");
        Ok(result >= 0)
    }

    async fn current_count(&self, key: &LimitKey) -> BackendResult<u64> {
        let redis_key = self.keys.counter(key);
        let count: Option<u64> = self
            .run("current_count", |mut conn| async move {
                redis::cmd("GET").arg(&redis_key).query_async(&mut conn).await
            })
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn reset(&self, key: &LimitKey) -> BackendResult<()> {
        let redis_key = self.keys.counter(key);
        let _: i64 = self
            .run("reset", |mut conn| async move {
                redis::cmd("DEL").arg(&redis_key).query_async(&mut conn).await
            })
            .await?;
        info!(key = %key, "Rate limit reset (distributed)");
        Ok(())
    }

    async fn block(
        &self,
        identifier: &str,
        reason: &str,
        duration: Duration,
    ) -> BackendResult<BlockRecord> {
        let record = BlockRecord::new(identifier, reason, duration, self.clock.now());
        let block_key = self.keys.block(identifier);
        let violations_key = self.keys.violations(identifier);
        let script = &self.scripts.block;
        let (blocked_at, expires_at) = (
            record.blocked_at.timestamp_millis(),
            record.expires_at.timestamp_millis(),
        );
        let ttl = ttl_secs(duration);

        let _: i64 = self
            .run("block", |mut conn| async move {
                script
                    .key(&block_key)
                    .key(&violations_key)
                    .arg(reason)
                    .arg(blocked_at)
                    .arg(expires_at)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        warn!(
            identifier = %identifier,
            reason = %reason,
            expires_at = %record.expires_at,
            "Identifier blocked (distributed)"
        );
        Ok(record)
    }

    async fn unblock(&self, identifier: &str) -> BackendResult<bool> {
        let block_key = self.keys.block(identifier);
        let removed: i64 = self
            .run("unblock", |mut conn| async move {
                redis::cmd("DEL").arg(&block_key).query_async(&mut conn).await
            })
            .await?;

        if removed > 0 {
            info!(identifier = %identifier, "Identifier unblocked (distributed)");
        }
        Ok(removed > 0)
    }

    async fn active_block(&self, identifier: &str) -> BackendResult<Option<BlockRecord>> {
        let block_key = self.keys.block(identifier);
        let fields: HashMap<String, String> = self
            .run("active_block", |mut conn| async move {
                redis::cmd("HGETALL").arg(&block_key).query_async(&mut conn).await
            })
            .await?;

        let now = self.clock.now();
        Ok(parse_block(identifier, &fields)?.filter(|record| record.is_active(now)))
    }

    async fn add_to_whitelist(&self, identifier: &str) -> BackendResult<()> {
        let key = self.keys.whitelist(identifier);
        let _: () = self
            .run("add_to_whitelist", |mut conn| async move {
                redis::cmd("SET").arg(&key).arg("1").query_async(&mut conn).await
            })
            .await?;
        info!(identifier = %identifier, "Identifier whitelisted (distributed)");
        Ok(())
    }

    async fn remove_from_whitelist(&self, identifier: &str) -> BackendResult<()> {
        let key = self.keys.whitelist(identifier);
        let _: i64 = self
            .run("remove_from_whitelist", |mut conn| async move {
                redis::cmd("DEL").arg(&key).query_async(&mut conn).await
            })
            .await?;
        info!(identifier = %identifier, "Identifier removed from whitelist (distributed)");
        Ok(())
    }

    async fn is_whitelisted(&self, identifier: &str) -> BackendResult<bool> {
        let key = self.keys.whitelist(identifier);
        self.run("is_whitelisted", |mut conn| async move {
            redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await
        })
        .await
    }

    async fn record_violation(&self, identifier: &str) -> BackendResult<u64> {
        let key = self.keys.violations(identifier);
        let script = &self.scripts.violation;
        let now = self.clock.now();
        let bucket = minute_bucket(now);
        let cutoff = minute_bucket(now - self.violation_window);
        let ttl = ttl_secs(self.violation_window);

        self.run("record_violation", |mut conn| async move {
            script
                .key(&key)
                .arg(bucket)
                .arg(cutoff)
                .arg(now.timestamp_millis())
                .arg(ttl)
                .invoke_async(&mut conn)
                .await
        })
        .await
    }

    async fn security_info(&self, identifier: &str) -> BackendResult<SecurityInfo> {
        let block_key = self.keys.block(identifier);
        let whitelist_key = self.keys.whitelist(identifier);
        let violations_key = self.keys.violations(identifier);

        let (block_fields, is_whitelisted, violation_fields): (
            HashMap<String, String>,
            bool,
            (Option<u64>, Option<i64>),
        ) = self
            .run("security_info", |mut conn| async move {
                redis::pipe()
                    .atomic()
                    .cmd("HGETALL")
                    .arg(&block_key)
                    .cmd("EXISTS")
                    .arg(&whitelist_key)
                    .cmd("HMGET")
                    .arg(&violations_key)
                    .arg("total")
                    .arg("last_at")
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let now = self.clock.now();
        let block = parse_block(identifier, &block_fields)?.filter(|record| record.is_active(now));
        let (total, last_at) = violation_fields;

        Ok(SecurityInfo {
            is_blocked: block.is_some(),
            block_reason: block.as_ref().map(|b| b.reason.clone()),
            block_expiry: block.as_ref().map(|b| b.expires_at),
            is_whitelisted,
            violation_count: total.unwrap_or(0),
            last_violation_at: last_at.and_then(DateTime::<Utc>::from_timestamp_millis),
        })
    }

    async fn health_check(&self) -> BackendResult<()> {
        let reply: String = self
            .run("health_check", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;

        if reply == "PONG" {
            Ok(())
        } else {
            Err(BackendError::Protocol(format!("unexpected PING reply: {}", reply)))
        }
    }
}

impl std::fmt::Debug for DistributedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedBackend")
            .field("keys", &self.keys)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::Arc;

    fn unreachable_config() -> RedisConfig {
        RedisConfig {
            enabled: true,
            // Port 1 is reserved; connecting is refused immediately
            url: "redis://127.0.0.1:1/".to_string(),
            key_prefix: "test:".to_string(),
            command_timeout_ms: 500,
        }
    }

    fn backend(config: &RedisConfig) -> DistributedBackend {
        DistributedBackend::new(config, Arc::new(SystemClock), Duration::minutes(60)).unwrap()
    }

    #[test]
    fn test_key_layout() {
        let keys = StoreKeys::new("rate_limit:");
        let key = LimitKey::new("10.0.0.1", "login");

        assert_eq!(keys.counter(&key), "rate_limit:counter:10.0.0.1:login");
        assert_eq!(keys.block("10.0.0.1"), "rate_limit:block:10.0.0.1");
        assert_eq!(keys.whitelist("10.0.0.1"), "rate_limit:whitelist:10.0.0.1");
        assert_eq!(keys.violations("10.0.0.1"), "rate_limit:violations:10.0.0.1");
    }

    #[test]
    fn test_keys_do_not_collide_across_namespaces() {
        let keys = StoreKeys::new("rate_limit:");
        let tricky = LimitKey::new("block", "10.0.0.1");
        assert_ne!(keys.counter(&tricky), keys.block("10.0.0.1"));
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let mut config = unreachable_config();
        config.url = "not a url".to_string();
        let result = DistributedBackend::new(&config, Arc::new(SystemClock), Duration::minutes(60));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_block_fields() {
        let now = Utc::now();
        let expires = now + Duration::minutes(30);
        let mut fields = HashMap::new();
        fields.insert("reason".to_string(), "manual".to_string());
        fields.insert("blocked_at".to_string(), now.timestamp_millis().to_string());
        fields.insert("expires_at".to_string(), expires.timestamp_millis().to_string());

        let record = parse_block("10.0.0.1", &fields).unwrap().unwrap();
        assert_eq!(record.identifier, "10.0.0.1");
        assert_eq!(record.reason, "manual");
        assert_eq!(record.expires_at.timestamp_millis(), expires.timestamp_millis());

        assert!(parse_block("10.0.0.1", &HashMap::new()).unwrap().is_none());

        fields.remove("expires_at");
        assert!(matches!(
            parse_block("10.0.0.1", &fields),
            Err(BackendError::Protocol(_))
        ));
    }

    #[test]
    fn test_ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::minutes(30)), 1800);
        assert_eq!(ttl_secs(Duration::milliseconds(1500)), 2);
        assert_eq!(ttl_secs(Duration::zero()), 1);
    }

    #[test]
    fn test_connection_level_errors() {
        assert!(is_connection_level(&BackendError::Timeout(std::time::Duration::from_secs(2))));
        assert!(is_connection_level(&BackendError::Connection("refused".to_string())));
        assert!(!is_connection_level(&BackendError::Protocol("bad".to_string())));
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_failure() {
        let config = unreachable_config();
        let backend = backend(&config);
        let key = LimitKey::new("10.0.0.1", "login");

        let started = std::time::Instant::now();
        assert!(backend.check_and_increment(&key, 10).await.is_err());
        assert!(backend.health_check().await.is_err());
        assert!(started.elapsed() < std::time::Duration::from_secs(3));
    }

    // These tests need a Redis server on localhost and are run with
    // `cargo test -- --ignored`.

    fn live_backend() -> DistributedBackend {
        let config = RedisConfig {
            enabled: true,
            url: "redis://127.0.0.1:6379/".to_string(),
            key_prefix: format!("warden-test:{}:", Utc::now().timestamp_nanos_opt().unwrap_or(0)),
            command_timeout_ms: 2000,
        };
        backend(&config)
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_increment_until_limit() {
        let backend = live_backend();
        let key = LimitKey::new("10.0.0.1", "login");

        for _ in 0..3 {
            assert!(backend.check_and_increment(&key, 3).await.unwrap());
        }
        assert!(!backend.check_and_increment(&key, 3).await.unwrap());
        assert_eq!(backend.current_count(&key).await.unwrap(), 3);

        backend.reset(&key).await.unwrap();
        assert_eq!(backend.current_count(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_block_whitelist_and_violations() {
        let backend = live_backend();

        assert_eq!(backend.record_violation("mallory").await.unwrap(), 1);
        assert_eq!(backend.record_violation("mallory").await.unwrap(), 2);

        let record = backend.block("mallory", "manual", Duration::minutes(5)).await.unwrap();
        let active = backend.active_block("mallory").await.unwrap().unwrap();
        assert_eq!(active.reason, "manual");
        assert_eq!(active.expires_at.timestamp_millis(), record.expires_at.timestamp_millis());

        backend.add_to_whitelist("mallory").await.unwrap();
        let info = backend.security_info("mallory").await.unwrap();
        assert!(info.is_blocked);
        assert!(info.is_whitelisted);
        assert_eq!(info.violation_count, 0, "blocking clears violation history");

        assert!(backend.unblock("mallory").await.unwrap());
        assert!(backend.active_block("mallory").await.unwrap().is_none());
        backend.remove_from_whitelist("mallory").await.unwrap();
        assert!(!backend.is_whitelisted("mallory").await.unwrap());
        backend.health_check().await.unwrap();
    }
}
