//! Single broadcast shutdown signal consulted by every activity.
//!
//! Replaces the original design's volatile flags and process-group signals:
//! one value, cloned into each thread, triggered exactly once with a cause.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Why the proxy is going down. Decides the process exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The peripheral vanished; a normal end of life for a proxy.
    Disconnect,
    /// Operator asked us to stop.
    Requested,
    /// Unrecoverable transport failure; exits non-zero.
    Fatal { subsystem: &'static str, detail: String },
}

struct Inner {
    triggered: AtomicBool,
    cause: Mutex<Option<ShutdownCause>>,
    cond: Condvar,
}

#[derive(Clone)]
pub struct Shutdown(Arc<Inner>);

impl Shutdown {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            triggered: AtomicBool::new(false),
            cause: Mutex::new(None),
            cond: Condvar::new(),
        }))
    }

    /// Trigger the broadcast. The first cause wins; later triggers are
    /// ignored so a fatal error is not masked by the cascade it causes.
    pub fn trigger(&self, cause: ShutdownCause) {
        let mut slot = self.0.cause.lock().unwrap();
        if slot.is_none() {
            tracing::debug!(?cause, "shutdown triggered");
            *slot = Some(cause);
            self.0.triggered.store(true, Ordering::Release);
            self.0.cond.notify_all();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.0.triggered.load(Ordering::Acquire)
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        self.0.cause.lock().unwrap().clone()
    }

    /// Block until triggered or `timeout` elapses; returns whether the
    /// signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut slot = self.0.cause.lock().unwrap();
        while slot.is_none() {
            let (next, res) = self.0.cond.wait_timeout(slot, timeout).unwrap();
            slot = next;
            if res.timed_out() {
                return slot.is_some();
            }
        }
        true
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
