//! Engine configuration.
//!
//! # Responsibility
//! - Hold tunables for retries, cache TTLs and audit output size.
//! - Load them from JSON with per-field defaults.
//!
//! # Invariants
//! - A config returned by [`SyncConfig::from_json_str`] has passed `validate()`.

use crate::cache::keys::{CacheTtls, DEFAULT_LISTING_TTL, DEFAULT_STATS_TTL};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read config: {err}"),
            Self::Parse(err) => write!(f, "failed to parse config: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

/// Bounded exponential backoff for shard propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(20);
        let millis = self
            .base_delay_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Policy without waits, for tests and one-shot tooling.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub listing_ttl_secs: u64,
    pub stats_ttl_secs: u64,
    pub op_timeout_ms: u64,
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn ttls(&self) -> CacheTtls {
        CacheTtls {
            listing: Duration::from_secs(self.listing_ttl_secs),
            statistics: Duration::from_secs(self.stats_ttl_secs),
        }
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            listing_ttl_secs: DEFAULT_LISTING_TTL.as_secs(),
            stats_ttl_secs: DEFAULT_STATS_TTL.as_secs(),
            op_timeout_ms: 50,
            max_entries: 4_096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    /// Length of the capacity-overage and dangling-preference lists.
    pub audit_top_n: u32,
    /// Outbox entries read per drain pass.
    pub drain_batch_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            audit_top_n: 10,
            drain_batch_size: 500,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        if self.audit_top_n == 0 || self.drain_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "audit_top_n and drain_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
