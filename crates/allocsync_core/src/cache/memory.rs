//! In-process TTL cache backing store.
//!
//! Entries expire lazily on access. Every operation waits at most
//! `op_timeout` for the lock and reports [`CacheError::Timeout`] otherwise,
//! which the layer turns into a miss.

use super::{CacheError, CacheResult, KvCache};
use crate::config::CacheConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_MAX_ENTRIES: usize = 4_096;
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(50);

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
    op_timeout: Duration,
}

impl MemoryCache {
    pub fn new(max_entries: usize, op_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            op_timeout,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.op_timeout())
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entries<T>(&self, op: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> CacheResult<T> {
        let mut guard = self
            .entries
            .try_lock_for(self.op_timeout)
            .ok_or(CacheError::Timeout)?;
        Ok(op(&mut guard))
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_OP_TIMEOUT)
    }
}

impl KvCache for MemoryCache {
    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.with_entries(|entries| {
            let expired = match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            };
            if expired {
                entries.remove(key);
            }
            None
        })
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let max_entries = self.max_entries;
        self.with_entries(|entries| {
            let now = Instant::now();
            entries.retain(|_, entry| entry.expires_at > now);
            if entries.len() >= max_entries && !entries.contains_key(key) {
                if let Some(victim) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(victim, _)| victim.clone())
                {
                    entries.remove(&victim);
                }
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: now + ttl,
                },
            );
        })
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }

    fn delete_by_prefix(&self, prefix: &str) -> CacheResult<usize> {
        self.with_entries(|entries| {
            let before = entries.len();
            entries.retain(|key, _| !key.starts_with(prefix));
            before - entries.len()
        })
    }
}
