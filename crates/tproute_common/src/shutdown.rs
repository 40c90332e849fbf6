//! Interruptible stop signal for the router's background threads.
//!
//! A periodic task waits on the signal between runs instead of sleeping,
//! so `stop()` ends the wait immediately rather than after a full interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Cooperative stop signal shared between a background thread and its owner.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

struct StopInner {
    stopped: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                stopped: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request stop and wake every waiter.
    pub fn stop(&self) {
        let _guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Wait up to `duration`. Returns `true` if stop was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_stopped() {
            return true;
        }
        let _ = self
            .inner
            .condvar
            .wait_timeout_while(guard, duration, |_| !self.is_stopped())
            .unwrap_or_else(|e| e.into_inner());
        self.is_stopped()
    }

    /// Run `work` now and then once per `interval` until stopped.
    pub fn run_every<F>(&self, interval: Duration, mut work: F)
    where
        F: FnMut(),
    {
        while !self.is_stopped() {
            work();
            if self.wait_timeout(interval) {
                break;
            }
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
