//! The process-wide halt signal.
//!
//! The daemon's main thread parks on [`HaltSignal::wait`] after bringing
//! everything up; any module can end the process cleanly by calling
//! [`HaltSignal::trigger`]; the replay path does so when the last sample
//! is consumed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Cloneable handle to one shared halt flag.
#[derive(Clone, Default)]
pub struct HaltSignal {
    inner: Arc<HaltInner>,
}

#[derive(Default)]
struct HaltInner {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl HaltSignal {
    /// Creates an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the signal and wakes every waiter. Idempotent.
    pub fn trigger(&self) {
        let mut triggered = self.inner.triggered.lock();
        *triggered = true;
        self.inner.cond.notify_all();
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.inner.triggered.lock()
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) {
        let mut triggered = self.inner.triggered.lock();
        while !*triggered {
            self.inner.cond.wait(&mut triggered);
        }
    }

    /// Blocks until the signal fires or `timeout` elapses. Returns whether
    /// the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut triggered = self.inner.triggered.lock();
        if !*triggered {
            self.inner.cond.wait_for(&mut triggered, timeout);
        }
        *triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn trigger_wakes_waiter() {
        let halt = HaltSignal::new();
        let waiter = {
            let halt = halt.clone();
            thread::spawn(move || halt.wait())
        };
        halt.trigger();
        waiter.join().unwrap();
        assert!(halt.is_triggered());
    }

    #[test]
    fn wait_timeout_reports_state() {
        let halt = HaltSignal::new();
        assert!(!halt.wait_timeout(Duration::from_millis(10)));
        halt.trigger();
        assert!(halt.wait_timeout(Duration::from_millis(10)));
    }
}
