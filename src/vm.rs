//! The shared virtual machine programs execute on: lockable numbered
//! resources plus thread-blocking timing operations.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::time::Duration;

use tracing::trace;

/// An exclusively-lockable resource. A condition variable rather than a
/// plain mutex, because the thread that releases a resource is generally
/// not the thread that acquired it.
struct VmResource {
    state: Mutex<ResourceState>,
    cond: Condvar,
}

#[derive(Default)]
struct ResourceState {
    taken: bool,
    /// Identity of the program currently holding the resource; consulted
    /// by `cleanup` to release what a finished program left behind.
    holder: u64,
}

impl VmResource {
    fn new() -> Self {
        Self {
            state: Mutex::new(ResourceState::default()),
            cond: Condvar::new(),
        }
    }
}

/// Resources are materialised lazily on first reference. The map lock is
/// held shared for lookups and exclusively for inserts and global cleanup.
#[derive(Default)]
pub struct VirtualMachine {
    resources: RwLock<HashMap<u64, Arc<VmResource>>>,
}

/// How long a lock wait may sleep before re-checking cancellation.
const LOCK_WAIT_SLICE: Duration = Duration::from_millis(100);

impl VirtualMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide VM shared by every HTTP protocol instance.
    pub fn shared() -> &'static Arc<VirtualMachine> {
        static VM: OnceLock<Arc<VirtualMachine>> = OnceLock::new();
        VM.get_or_init(|| Arc::new(VirtualMachine::new()))
    }

    fn resource(&self, num: u64) -> Arc<VmResource> {
        {
            let map = self.resources.read().unwrap();
            if let Some(res) = map.get(&num) {
                return res.clone();
            }
        }
        let mut map = self.resources.write().unwrap();
        map.entry(num)
            .or_insert_with(|| Arc::new(VmResource::new()))
            .clone()
    }

    /// Acquire resource `num` on behalf of `identity`, blocking the calling
    /// thread. The wait is sliced so that `cancellation` is noticed within
    /// 100 ms; on cancellation the lock is simply not acquired.
    pub fn lock(&self, identity: u64, num: u64, cancellation: &AtomicBool) {
        let res = self.resource(num);

        while !cancellation.load(Ordering::SeqCst) {
            let state = res.state.lock().unwrap();
            let (mut state, timeout) = res
                .cond
                .wait_timeout_while(state, LOCK_WAIT_SLICE, |s| s.taken)
                .unwrap();

            if !timeout.timed_out() {
                state.taken = true;
                state.holder = identity;
                trace!(identity, num, "vm resource locked");
                break;
            }
        }
    }

    /// Release resource `num`. The caller contract says `identity` holds
    /// it, but that is not verified here: unlocking a resource someone
    /// else holds is not detected. `cleanup` is what relies on the
    /// recorded holder.
    pub fn unlock(&self, identity: u64, num: u64) {
        let res = self.resource(num);
        let mut state = res.state.lock().unwrap();
        state.taken = false;
        res.cond.notify_one();
        trace!(identity, num, "vm resource unlocked");
    }

    /// Release every resource held by `identity`.
    pub fn cleanup(&self, identity: u64) {
        let map = self.resources.write().unwrap();
        for res in map.values() {
            let mut state = res.state.lock().unwrap();
            if state.holder == identity {
                state.taken = false;
                res.cond.notify_one();
            }
        }
    }

    /// Block the calling thread for `micros` microseconds.
    pub fn sleep(&self, micros: u64) {
        std::thread::sleep(Duration::from_micros(micros));
    }

    /// Busy-spin for `cycles` iterations. `black_box` keeps the loop from
    /// being hoisted away.
    pub fn spin(&self, cycles: u64) {
        for i in 0..cycles {
            std::hint::black_box(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn lock_serialises_two_holders() {
        let vm = Arc::new(VirtualMachine::new());
        let cancel = Arc::new(AtomicBool::new(false));

        vm.lock(1, 7, &cancel);

        let vm2 = vm.clone();
        let cancel2 = cancel.clone();
        let start = Instant::now();
        let waiter = thread::spawn(move || {
            vm2.lock(2, 7, &cancel2);
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        vm.unlock(1, 7);

        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
    }

    #[test]
    fn cancellation_unblocks_lock_wait() {
        let vm = Arc::new(VirtualMachine::new());
        let cancel = Arc::new(AtomicBool::new(false));

        vm.lock(1, 3, &cancel);

        let vm2 = vm.clone();
        let cancel2 = cancel.clone();
        let waiter = thread::spawn(move || vm2.lock(2, 3, &cancel2));

        thread::sleep(Duration::from_millis(30));
        cancel.store(true, Ordering::SeqCst);
        waiter.join().unwrap();

        // The cancelled waiter must not have taken the resource.
        let res = vm.resource(3);
        let state = res.state.lock().unwrap();
        assert!(state.taken);
        assert_eq!(state.holder, 1);
    }

    #[test]
    fn cleanup_releases_only_the_identity() {
        let vm = VirtualMachine::new();
        let cancel = AtomicBool::new(false);

        vm.lock(1, 10, &cancel);
        vm.lock(1, 11, &cancel);
        vm.lock(2, 12, &cancel);

        vm.cleanup(1);

        assert!(!vm.resource(10).state.lock().unwrap().taken);
        assert!(!vm.resource(11).state.lock().unwrap().taken);
        assert!(vm.resource(12).state.lock().unwrap().taken);
    }

    #[test]
    fn unlock_is_permissive() {
        let vm = VirtualMachine::new();
        // Unlocking a never-locked resource just materialises it released.
        vm.unlock(9, 99);
        assert!(!vm.resource(99).state.lock().unwrap().taken);
    }
}
