//! Configuration management for Warden.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, WardenError};

/// Upper bound for a single distributed-store round trip.
pub const MAX_COMMAND_TIMEOUT_MS: u64 = 2000;

/// Upper bound for minute-valued durations (100 years).
pub const MAX_DURATION_MINUTES: u64 = 60 * 24 * 365 * 100;

/// Main configuration for the Warden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Rate limiting policy
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Distributed backend connection
    #[serde(default)]
    pub redis: RedisConfig,

    /// Background task schedule
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Rate limiting policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Max operations per identifier+action per 60 second window
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u64,

    /// Reserved for a token-bucket refinement; informational only
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u64,

    /// Violations inside the window that trigger an auto-block
    #[serde(default = "default_max_violations")]
    pub max_violations_before_block: u64,

    /// Duration of an auto-block
    #[serde(default = "default_block_duration")]
    pub block_duration_minutes: u64,

    /// Rolling window for violation counting
    #[serde(default = "default_violation_window")]
    pub violation_window_minutes: u64,

    /// Local counter count above which a failover triggers cleanup
    #[serde(default = "default_memory_cache_limit")]
    pub memory_cache_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst_capacity: default_burst_capacity(),
            max_violations_before_block: default_max_violations(),
            block_duration_minutes: default_block_duration(),
            violation_window_minutes: default_violation_window(),
            memory_cache_limit: default_memory_cache_limit(),
        }
    }
}

fn default_requests_per_minute() -> u64 {
    60
}

fn default_burst_capacity() -> u64 {
    100
}

fn default_max_violations() -> u64 {
    5
}

fn default_block_duration() -> u64 {
    30
}

fn default_violation_window() -> u64 {
    60
}

fn default_memory_cache_limit() -> usize {
    1000
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Whether the distributed backend is used at all
    #[serde(default)]
    pub enabled: bool,

    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on every round trip, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl LimitsConfig {
    /// The auto-block duration.
    pub fn block_duration(&self) -> chrono::Duration {
        minutes(self.block_duration_minutes)
    }

    /// The rolling violation window.
    pub fn violation_window(&self) -> chrono::Duration {
        minutes(self.violation_window_minutes)
    }
}

/// Convert minutes to a `chrono::Duration`, clamped to `MAX_DURATION_MINUTES`.
pub fn minutes(value: u64) -> chrono::Duration {
    chrono::Duration::minutes(value.min(MAX_DURATION_MINUTES) as i64)
}

fn check_minutes(name: &str, value: u64) -> Result<()> {
    if value == 0 || value > MAX_DURATION_MINUTES {
        return Err(WardenError::Config(format!(
            "{} must be within 1..={}",
            name, MAX_DURATION_MINUTES
        )));
    }
    Ok(())
}

impl RedisConfig {
    /// The per-call timeout as a `Duration`.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

fn default_command_timeout() -> u64 {
    MAX_COMMAND_TIMEOUT_MS
}

/// Background task schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// How often to probe the distributed backend while in fallback
    #[serde(default = "default_probe_interval")]
    pub health_probe_interval_secs: u64,

    /// How often to sweep stale window counters
    #[serde(default = "default_counter_reap_interval")]
    pub counter_reap_interval_secs: u64,

    /// Grace period after a window expires before its counter is swept
    #[serde(default = "default_counter_retention")]
    pub counter_retention_secs: u64,

    /// How often to sweep expired blocks
    #[serde(default = "default_block_reap_interval")]
    pub block_reap_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            health_probe_interval_secs: default_probe_interval(),
            counter_reap_interval_secs: default_counter_reap_interval(),
            counter_retention_secs: default_counter_retention(),
            block_reap_interval_secs: default_block_reap_interval(),
        }
    }
}

fn default_probe_interval() -> u64 {
    30
}

fn default_counter_reap_interval() -> u64 {
    60
}

fn default_counter_retention() -> u64 {
    300
}

fn default_block_reap_interval() -> u64 {
    300
}

impl WardenConfig {
    /// Load configuration from a file, with `WARDEN__SECTION__KEY`
    /// environment variables taking precedence.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("WARDEN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: WardenConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameters the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.requests_per_minute == 0 {
            return Err(WardenError::Config(
                "requests_per_minute must be greater than 0".to_string(),
            ));
        }
        if limits.burst_capacity < limits.requests_per_minute {
            return Err(WardenError::Config(format!(
                "burst_capacity ({}) cannot be below requests_per_minute ({})",
                limits.burst_capacity, limits.requests_per_minute
            )));
        }
        if limits.max_violations_before_block == 0 {
            return Err(WardenError::Config(
                "max_violations_before_block must be greater than 0".to_string(),
            ));
        }
        check_minutes("block_duration_minutes", limits.block_duration_minutes)?;
        check_minutes("violation_window_minutes", limits.violation_window_minutes)?;

        if self.redis.key_prefix.is_empty() {
            return Err(WardenError::Config("redis.key_prefix cannot be empty".to_string()));
        }
        if self.redis.command_timeout_ms == 0 || self.redis.command_timeout_ms > MAX_COMMAND_TIMEOUT_MS {
            return Err(WardenError::Config(format!(
                "redis.command_timeout_ms must be within 1..={}",
                MAX_COMMAND_TIMEOUT_MS
            )));
        }

        let m = &self.maintenance;
        if m.health_probe_interval_secs == 0
            || m.counter_reap_interval_secs == 0
            || m.block_reap_interval_secs == 0
        {
            return Err(WardenError::Config(
                "maintenance intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.limits.requests_per_minute, 60);
        assert_eq!(config.limits.burst_capacity, 100);
        assert_eq!(config.limits.max_violations_before_block, 5);
        assert_eq!(config.limits.block_duration_minutes, 30);
        assert_eq!(config.limits.violation_window_minutes, 60);
        assert_eq!(config.limits.memory_cache_limit, 1000);
        assert!(!config.redis.enabled);
        assert_eq!(config.redis.key_prefix, "rate_limit:");
        assert_eq!(config.redis.command_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
limits:
  requests_per_minute: 10
  burst_capacity: 20
redis:
  enabled: true
  url: redis://cache:6379/
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limits.requests_per_minute, 10);
        assert_eq!(config.limits.max_violations_before_block, 5);
        assert!(config.redis.enabled);
        assert_eq!(config.redis.url, "redis://cache:6379/");
        assert_eq!(config.maintenance.health_probe_interval_secs, 30);
    }

    #[test]
    fn test_rejects_zero_limit() {
        let yaml = r#"
limits:
  requests_per_minute: 0
"#;
        let err = WardenConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn test_rejects_long_timeout() {
        let mut config = WardenConfig::default();
        config.redis.command_timeout_ms = 5000;
        assert!(config.validate().is_err());

        config.redis.command_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_huge_violation_window() {
        let mut config = WardenConfig::default();
        config.limits.violation_window_minutes = u64::MAX / 2;
        assert!(matches!(config.validate(), Err(WardenError::Config(_))));

        config.limits.violation_window_minutes = MAX_DURATION_MINUTES;
        assert!(config.validate().is_ok());

        config.limits.block_duration_minutes = MAX_DURATION_MINUTES + 1;
        assert!(matches!(config.validate(), Err(WardenError::Config(_))));

        config.limits.block_duration_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_minutes_are_clamped() {
        assert_eq!(minutes(30), chrono::Duration::minutes(30));
        assert_eq!(minutes(u64::MAX), chrono::Duration::minutes(MAX_DURATION_MINUTES as i64));
        assert_eq!(LimitsConfig::default().violation_window(), chrono::Duration::minutes(60));
    }

    #[test]
    fn test_rejects_burst_below_rate() {
        let mut config = WardenConfig::default();
        config.limits.burst_capacity = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_applies_env_overrides() {
        let path = std::env::temp_dir().join(format!("warden-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "limits:\n  requests_per_minute: 10\n  burst_capacity: 100\nredis:\n  key_prefix: \"app:\"\n",
        )
        .unwrap();

        std::env::set_var("WARDEN__LIMITS__REQUESTS_PER_MINUTE", "42");
        let result = WardenConfig::from_file(path.to_str().unwrap());
        std::env::remove_var("WARDEN__LIMITS__REQUESTS_PER_MINUTE");
        std::fs::remove_file(&path).unwrap();

        let config = result.unwrap();
        assert_eq!(config.limits.requests_per_minute, 42);
        assert_eq!(config.limits.burst_capacity, 100);
        assert_eq!(config.redis.key_prefix, "app:");
        assert_eq!(config.limits.block_duration_minutes, 30);
    }

    #[test]
    fn test_from_file_missing_is_config_error() {
        let err = WardenConfig::from_file("/nonexistent/warden-config.yaml").unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let err = WardenConfig::from_yaml("limits: [1, 2").unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }
}
