//! Shutdown-path synchronisation primitives.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// A one-shot trigger that waits out in-scope guards.
///
/// `acquire` hands out scope guards while the trigger has not fired; each
/// guard blocks `trigger` for its lifetime. Once `trigger` returns, no new
/// guard can be acquired. Triggering twice is a programming fault.
#[derive(Default)]
pub struct TriggerGuard {
    triggered: AtomicBool,
    refs: AtomicUsize,
    mtx: Mutex<()>,
    cv: Condvar,
}

pub struct ScopeGuard<'a> {
    owner: &'a TriggerGuard,
}

impl TriggerGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a guard that delays `trigger` until it is dropped. Returns
    /// `None` once the trigger has fired.
    pub fn acquire(&self) -> Option<ScopeGuard<'_>> {
        let _lk = self.mtx.lock().unwrap();
        if self.triggered.load(Ordering::SeqCst) {
            return None;
        }
        self.refs.fetch_add(1, Ordering::SeqCst);
        Some(ScopeGuard { owner: self })
    }

    /// Fire the trigger, blocking until every outstanding guard has been
    /// released. No guard acquired afterwards will succeed.
    pub fn trigger(&self) {
        let mut lk = self.mtx.lock().unwrap();
        assert!(
            !self.triggered.load(Ordering::SeqCst),
            "trigger() on an already-triggered guard"
        );
        while self.refs.load(Ordering::SeqCst) > 0 {
            lk = self.cv.wait(lk).unwrap();
        }
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.owner.refs.fetch_sub(1, Ordering::SeqCst);
        self.owner.cv.notify_all();
    }
}

/// Like `std::sync::Once`, but re-armable. Used to make a session's
/// finalize run at most once per acquire cycle.
#[derive(Default)]
pub struct ResettableOnceFlag {
    invoked: Mutex<bool>,
}

impl ResettableOnceFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        *self.invoked.lock().unwrap() = false;
    }

    /// Run `f` if nothing has run since the last `reset`. Returns whether
    /// `f` ran.
    pub fn run_once(&self, f: impl FnOnce()) -> bool {
        let mut invoked = self.invoked.lock().unwrap();
        if *invoked {
            return false;
        }
        *invoked = true;
        f();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn guard_blocks_trigger_until_released() {
        let guard = Arc::new(TriggerGuard::new());
        let scope = guard.acquire();
        assert!(scope.is_some());

        let g = guard.clone();
        let trigger_thread = thread::spawn(move || g.trigger());

        // The trigger must not complete while the scope is held.
        thread::sleep(Duration::from_millis(50));
        assert!(!guard.triggered());

        drop(scope);
        trigger_thread.join().unwrap();
        assert!(guard.triggered());
        assert!(guard.acquire().is_none());
    }

    #[test]
    fn acquire_after_trigger_fails() {
        let guard = TriggerGuard::new();
        guard.trigger();
        assert!(guard.acquire().is_none());
    }

    #[test]
    #[should_panic]
    fn double_trigger_is_a_fault() {
        let guard = TriggerGuard::new();
        guard.trigger();
        guard.trigger();
    }

    #[test]
    fn once_flag_runs_once_per_reset() {
        let flag = ResettableOnceFlag::new();
        let mut count = 0;
        assert!(flag.run_once(|| count += 1));
        assert!(!flag.run_once(|| count += 1));
        assert_eq!(count, 1);

        flag.reset();
        assert!(flag.run_once(|| count += 1));
        assert_eq!(count, 2);
    }
}
