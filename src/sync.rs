//! Blocking gates used by the rendezvous coordinator.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A wake-up point that threads wait on for a condition over shared state.
///
/// The condition is always evaluated under the gate's mutex, and
/// [`Gate::notify`] takes that mutex before waking, so a state change made
/// before `notify` is never missed by a waiter.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Gate {
    /// Creates a gate.
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Wakes every waiter so it re-evaluates its condition.
    pub fn notify(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    /// Blocks until `ready` returns `true`.
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .cond
            .wait_while(guard, |_| !ready())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Blocks until `ready` returns `true` or `timeout` elapses.
    ///
    /// Returns whether the condition became true.
    pub fn wait_timeout_until(&self, timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (_guard, result) = self
            .cond
            .wait_timeout_while(guard, timeout, |_| !ready())
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }
}
