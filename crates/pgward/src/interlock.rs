//! Defers stop requests while irrevocable initialisation is in flight.
//!
//! The supervisor marks cluster initialisation and schema bootstrap as a
//! critical section. A stop request arriving inside the window blocks until
//! the window closes; concurrent stop requests fold into the same wait and
//! the caller-side teardown runs once. All mutation happens under one mutex
//! so the starting and stopping call paths never race.

use std::sync::{Condvar, Mutex};

use tracing::debug;

const INTERLOCK_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::interlock");

#[derive(Debug, Default)]
struct InterlockState {
    critical: bool,
    stop_requested: bool,
}

/// Guarded critical-section flag with a stop-waiter.
#[derive(Debug, Default)]
pub struct ShutdownInterlock {
    state: Mutex<InterlockState>,
    released: Condvar,
}

impl ShutdownInterlock {
    /// Builds an interlock with the critical flag clear.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of the critical section. Must precede any step that
    /// a stop request is not allowed to interrupt.
    pub fn enter_critical(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        state.critical = true;
    }

    /// Marks the end of the critical section and releases any queued stop
    /// waiter. Safe to call with no waiter pending, and when the flag is
    /// already clear.
    pub fn exit_critical(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        state.critical = false;
        self.released.notify_all();
    }

    /// Whether the critical section is currently active.
    #[must_use]
    pub fn critical(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .critical
    }

    /// Whether a stop has been requested, released or not.
    #[must_use]
    pub fn stop_pending(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .stop_requested
    }

    /// Registers a stop request. Returns immediately when the critical flag
    /// is clear; otherwise blocks until `exit_critical` runs.
    pub fn request_stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        state.stop_requested = true;
        if state.critical {
            debug!(
                target: INTERLOCK_TARGET,
                "stop requested inside critical section; deferring"
            );
        }
        while state.critical {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn stop_proceeds_immediately_outside_the_critical_section() {
        let interlock = ShutdownInterlock::new();
        interlock.request_stop();
        assert!(interlock.stop_pending());
    }

    #[test]
    fn stop_waits_until_the_critical_section_exits() {
        let interlock = Arc::new(ShutdownInterlock::new());
        interlock.enter_critical();

        let proceeded = Arc::new(AtomicBool::new(false));
        let handle = {
            let interlock = Arc::clone(&interlock);
            let proceeded = Arc::clone(&proceeded);
            thread::spawn(move || {
                interlock.request_stop();
                proceeded.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!proceeded.load(Ordering::SeqCst), "stop ran inside critical section");

        interlock.exit_critical();
        handle.join().unwrap();
        assert!(proceeded.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_stop_requests_fold_into_one_release() {
        let interlock = Arc::new(ShutdownInterlock::new());
        interlock.enter_critical();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let interlock = Arc::clone(&interlock);
                thread::spawn(move || interlock.request_stop())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        interlock.exit_critical();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(interlock.stop_pending());
    }

    #[test]
    fn exit_critical_without_a_waiter_is_a_no_op_release() {
        let interlock = ShutdownInterlock::new();
        interlock.exit_critical();
        assert!(!interlock.critical());
        assert!(!interlock.stop_pending());
    }

    #[test]
    fn stop_pending_is_visible_during_the_critical_section() {
        let interlock = Arc::new(ShutdownInterlock::new());
        interlock.enter_critical();
        let handle = {
            let interlock = Arc::clone(&interlock);
            thread::spawn(move || interlock.request_stop())
        };
        // Wait for the requester to register before asserting.
        while !interlock.stop_pending() {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(interlock.critical());
        interlock.exit_critical();
        handle.join().unwrap();
    }
}
