//! Cooperative shutdown signal for retry loops.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cloneable flag that wakes sleeping retry loops when triggered.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, wakeup) = &*self.inner;
        *flag.lock() = true;
        wakeup.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleeps for `timeout` or until triggered. Returns `true` if triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, wakeup) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut triggered = flag.lock();
        while !*triggered {
            if wakeup.wait_until(&mut triggered, deadline).timed_out() {
                break;
            }
        }
        *triggered
    }
}
