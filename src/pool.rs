//! Generic reusable-object cache.
//!
//! Items are handed out LIFO for cache affinity. A pool may be bounded
//! (`max_size > 0`) or unbounded, and a bounded pool can preallocate its
//! whole population eagerly. One asynchronous waiter may be parked on an
//! exhausted pool; the next `put_back` hands its item straight to the
//! waiter instead of the free stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Identity tag recorded against a borrowed item, used by
/// [`Pool::recover`] to find items stranded on a failed owner.
pub type PoolId = u64;

pub const POOL_ID_NONE: PoolId = u64::MAX;

/// Implemented by every pooled type. `finalize` is the forced teardown
/// invoked by [`Pool::recover`] on items whose owner died.
pub trait Poolable: Send + Sync + 'static {
    fn finalize(self: Arc<Self>) {}
}

#[derive(Debug, Default)]
pub struct PoolStats {
    total: AtomicUsize,
    in_flight: AtomicUsize,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

type Waiter<T> = Box<dyn FnOnce(Arc<T>) + Send>;
type Factory<T> = Box<dyn Fn() -> Arc<T> + Send + Sync>;

struct Inner<T> {
    /// LIFO free stack.
    free: Vec<Arc<T>>,
    /// Every item ever created, keyed by allocation address, with the
    /// identity of its current borrower (`POOL_ID_NONE` while free).
    all: HashMap<usize, (Arc<T>, PoolId)>,
    waiter: Option<Waiter<T>>,
}

pub struct Pool<T: Poolable> {
    max_size: usize,
    factory: Factory<T>,
    inner: Mutex<Inner<T>>,
    stats: PoolStats,
}

fn key_of<T>(item: &Arc<T>) -> usize {
    Arc::as_ptr(item) as usize
}

impl<T: Poolable> Pool<T> {
    /// `max_size == 0` means unbounded. An eager pool preallocates
    /// `max_size` items up front, so an eager unbounded pool is a
    /// construction fault.
    pub fn new(max_size: usize, eager: bool, factory: Factory<T>) -> Self {
        assert!(
            !(eager && max_size == 0),
            "eager pool requires a bounded max_size"
        );

        let pool = Self {
            max_size,
            factory,
            inner: Mutex::new(Inner {
                free: Vec::new(),
                all: HashMap::new(),
                waiter: None,
            }),
            stats: PoolStats::default(),
        };

        if eager {
            let mut inner = pool.inner.lock().unwrap();
            for _ in 0..max_size {
                let item = (pool.factory)();
                inner.all.insert(key_of(&item), (item.clone(), POOL_ID_NONE));
                inner.free.push(item);
            }
            pool.stats.total.store(max_size, Ordering::Relaxed);
        }

        pool
    }

    /// Borrow an item, tagging it with `id`. Returns `None` only when the
    /// pool is bounded and fully in flight.
    pub fn borrow(&self, id: PoolId) -> Option<Arc<T>> {
        let mut inner = self.inner.lock().unwrap();
        self.try_borrow(&mut inner, id)
    }

    /// Borrow as [`Pool::borrow`]; when an item is available it is both
    /// delivered to `callback` and returned. When the pool is exhausted,
    /// `callback` is parked as the pending waiter and the next `put_back`
    /// feeds it. Installing a second waiter is a programming fault.
    pub fn borrow_async(
        &self,
        callback: impl FnOnce(Arc<T>) + Send + 'static,
        id: PoolId,
    ) -> Option<Arc<T>> {
        let item = {
            let mut inner = self.inner.lock().unwrap();
            match self.try_borrow(&mut inner, id) {
                Some(item) => item,
                None => {
                    assert!(
                        inner.waiter.is_none(),
                        "borrow_async on a pool that already has a waiter"
                    );
                    inner.waiter = Some(Box::new(callback));
                    return None;
                }
            }
        };
        callback(item.clone());
        Some(item)
    }

    fn try_borrow(&self, inner: &mut Inner<T>, id: PoolId) -> Option<Arc<T>> {
        let item = match inner.free.pop() {
            Some(item) => item,
            None => {
                if self.max_size != 0 && self.stats.in_flight() >= self.max_size {
                    return None;
                }
                let item = (self.factory)();
                inner.all.insert(key_of(&item), (item.clone(), POOL_ID_NONE));
                self.stats.total.fetch_add(1, Ordering::Relaxed);
                item
            }
        };

        if let Some(entry) = inner.all.get_mut(&key_of(&item)) {
            entry.1 = id;
        }
        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Return an item. A parked waiter consumes it directly, in which case
    /// the item stays in flight.
    pub fn put_back(&self, item: Arc<T>) {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            match inner.waiter.take() {
                Some(w) => Some(w),
                None => {
                    if let Some(entry) = inner.all.get_mut(&key_of(&item)) {
                        entry.1 = POOL_ID_NONE;
                    }
                    inner.free.push(item.clone());
                    debug_assert!(self.stats.in_flight() > 0);
                    self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
                    None
                }
            }
        };

        // Run the waiter outside the pool lock; it will typically restart
        // a session, which may touch this pool again.
        if let Some(waiter) = waiter {
            waiter(item);
        }
    }

    /// Force-finalize every in-flight item tagged with `id`. Used to rescue
    /// items stranded on a stopped reactor.
    pub fn recover(&self, id: PoolId) {
        let stranded: Vec<Arc<T>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .all
                .values()
                .filter(|(_, owner)| *owner == id)
                .map(|(item, _)| item.clone())
                .collect()
        };

        for item in stranded {
            item.finalize();
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Visit every item ever created by the pool, free or in flight.
    pub fn for_each_item(&self, mut f: impl FnMut(&Arc<T>)) {
        let items: Vec<Arc<T>> = {
            let inner = self.inner.lock().unwrap();
            inner.all.values().map(|(item, _)| item.clone()).collect()
        };
        for item in &items {
            f(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    struct TestItem {
        finalized: AtomicBool,
    }

    impl Poolable for TestItem {
        fn finalize(self: Arc<Self>) {
            self.finalized.store(true, Ordering::SeqCst);
        }
    }

    fn test_pool(max_size: usize, eager: bool) -> Pool<TestItem> {
        Pool::new(
            max_size,
            eager,
            Box::new(|| {
                Arc::new(TestItem {
                    finalized: AtomicBool::new(false),
                })
            }),
        )
    }

    #[test]
    fn borrow_is_lifo() {
        let pool = test_pool(0, false);
        let a = pool.borrow(0).unwrap();
        let b = pool.borrow(0).unwrap();
        pool.put_back(a.clone());
        pool.put_back(b.clone());

        // b went back last, so it comes out first.
        let c = pool.borrow(0).unwrap();
        assert!(Arc::ptr_eq(&c, &b));
        let d = pool.borrow(0).unwrap();
        assert!(Arc::ptr_eq(&d, &a));
    }

    #[test]
    fn bounded_pool_exhausts() {
        let pool = test_pool(2, false);
        let a = pool.borrow(0).unwrap();
        let _b = pool.borrow(0).unwrap();
        assert!(pool.borrow(0).is_none());

        pool.put_back(a);
        assert!(pool.borrow(0).is_some());
    }

    #[test]
    fn eager_pool_preallocates() {
        let pool = test_pool(3, false);
        assert_eq!(pool.stats().total(), 0);

        let eager = test_pool(3, true);
        assert_eq!(eager.stats().total(), 3);
        assert_eq!(eager.stats().in_flight(), 0);
        let _ = pool;
    }

    #[test]
    #[should_panic]
    fn eager_unbounded_pool_is_a_fault() {
        let _ = test_pool(0, true);
    }

    #[test]
    fn in_flight_tracks_borrows_minus_put_backs() {
        let pool = test_pool(0, false);
        let a = pool.borrow(0).unwrap();
        let b = pool.borrow(0).unwrap();
        assert_eq!(pool.stats().in_flight(), 2);
        pool.put_back(a);
        assert_eq!(pool.stats().in_flight(), 1);
        pool.put_back(b);
        assert_eq!(pool.stats().in_flight(), 0);
    }

    #[test]
    fn waiter_receives_next_put_back() {
        let pool = test_pool(1, false);
        let a = pool.borrow(0).unwrap();

        let (tx, rx) = mpsc::channel();
        assert!(pool.borrow_async(move |item| tx.send(item).unwrap(), 0).is_none());

        pool.put_back(a.clone());
        let delivered = rx.recv().unwrap();
        assert!(Arc::ptr_eq(&delivered, &a));
        // The waiter consumed the item, so it is still in flight.
        assert_eq!(pool.stats().in_flight(), 1);
    }

    #[test]
    fn borrow_async_with_capacity_delivers_immediately() {
        let pool = test_pool(1, false);
        let (tx, rx) = mpsc::channel();
        let item = pool.borrow_async(move |item| tx.send(item).unwrap(), 0);
        assert!(item.is_some());
        assert!(Arc::ptr_eq(&rx.recv().unwrap(), &item.unwrap()));
    }

    #[test]
    #[should_panic]
    fn double_waiter_is_a_fault() {
        let pool = test_pool(1, false);
        let _a = pool.borrow(0).unwrap();
        pool.borrow_async(|_| {}, 0);
        pool.borrow_async(|_| {}, 0);
    }

    #[test]
    fn recover_finalizes_tagged_items() {
        let pool = test_pool(0, false);
        let a = pool.borrow(3).unwrap();
        let b = pool.borrow(4).unwrap();

        pool.recover(3);
        assert!(a.finalized.load(Ordering::SeqCst));
        assert!(!b.finalized.load(Ordering::SeqCst));
    }
}
