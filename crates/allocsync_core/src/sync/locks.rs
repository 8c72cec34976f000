//! Per-key critical sections.
//!
//! Recomputations for the same internship id run one at a time; different
//! ids never contend beyond the short map lookup.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `op` while holding the lock for `key`.
    pub fn with_key<T>(&self, key: &str, op: impl FnOnce() -> T) -> T {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.to_string()).or_default())
        };

        let result = {
            let _guard = slot.lock();
            op()
        };

        let mut slots = self.slots.lock();
        // Map + this call are the only holders: nobody is waiting on the key.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key);
        }
        result
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.slots.lock().len()
    }
}
