//! Read-through, write-invalidate cache in front of listing and stats reads.
//!
//! # Responsibility
//! - Define the key-value TTL collaborator contract ([`KvCache`]).
//! - Absorb every backing-store failure behind [`CacheLayer`].
//!
//! # Invariants
//! - No `CacheLayer` method returns a cache error: failures degrade to a
//!   miss (reads) or a no-op (writes/deletes) and are logged.
//! - Cached values are JSON strings; undecodable values count as misses.
//! - A loaded value is not stored if an invalidation ran while it was being
//!   loaded, so a read after an acknowledged write never caches older rows.

pub mod keys;
pub mod memory;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

pub type CacheResult<T> = Result<T, CacheError>;

/// Backing-store failure. Never escapes [`CacheLayer`].
#[derive(Debug)]
pub enum CacheError {
    Unavailable(String),
    /// The operation did not get the store within its time budget.
    Timeout,
    Serialization(serde_json::Error),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "cache unavailable: {message}"),
            Self::Timeout => write!(f, "cache operation timed out"),
            Self::Serialization(err) => write!(f, "cache value encoding failed: {err}"),
        }
    }
}

impl Error for CacheError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Serialization(err) => Some(err),
            Self::Unavailable(_) | Self::Timeout => None,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Generic key-value TTL cache consumed by the engine.
pub trait KvCache: Send + Sync {
    fn get(&self, key: &str) -> CacheResult<Option<String>>;
    fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;
    fn delete(&self, key: &str) -> CacheResult<()>;
    /// Returns how many keys were removed.
    fn delete_by_prefix(&self, prefix: &str) -> CacheResult<usize>;
}

/// Failure-transparent facade over an optional [`KvCache`].
#[derive(Clone, Default)]
pub struct CacheLayer {
    backend: Option<Arc<dyn KvCache>>,
    /// Bumped by every invalidation; shared by clones of this layer.
    epoch: Arc<Mutex<u64>>,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn KvCache>) -> Self {
        Self {
            backend: Some(backend),
            epoch: Arc::default(),
        }
    }

    /// A layer with no backing store: every read misses.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            epoch: Arc::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let backend = self.backend.as_ref()?;
        match backend.get(key) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    debug!("event=cache_get module=cache status=hit key={key}");
                    Some(value)
                }
                Err(err) => {
                    warn!("event=cache_get module=cache status=degraded key={key} error={err}");
                    None
                }
            },
            Ok(None) => {
                debug!("event=cache_get module=cache status=miss key={key}");
                None
            }
            Err(err) => {
                warn!("event=cache_get module=cache status=degraded key={key} error={err}");
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let result = serde_json::to_string(value)
            .map_err(CacheError::from)
            .and_then(|raw| backend.set(key, raw, ttl));
        if let Err(err) = result {
            warn!("event=cache_set module=cache status=degraded key={key} error={err}");
        }
    }

    pub fn delete(&self, key: &str) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        if let Err(err) = backend.delete(key) {
            warn!("event=cache_delete module=cache status=degraded key={key} error={err}");
        }
    }

    pub fn delete_by_prefix(&self, prefix: &str) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        match backend.delete_by_prefix(prefix) {
            Ok(removed) => {
                debug!("event=cache_invalidate module=cache status=ok prefix={prefix} removed={removed}")
            }
            Err(err) => {
                warn!("event=cache_invalidate module=cache status=degraded prefix={prefix} error={err}")
            }
        }
    }

    /// Returns the cached value for `key`, or runs `load` and caches its result.
    ///
    /// Loader errors are returned unchanged and nothing is cached.
    pub fn get_or_load<T, E, F>(&self, key: &str, ttl: Duration, load: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.get_json(key) {
            return Ok(value);
        }
        let loaded_at = *self.epoch.lock();
        let value = load()?;
        let epoch = self.epoch.lock();
        if *epoch == loaded_at {
            self.set_json(key, &value, ttl);
        } else {
            debug!("event=cache_set module=cache status=skipped key={key} reason=invalidated_during_load");
        }
        drop(epoch);
        Ok(value)
    }
}
