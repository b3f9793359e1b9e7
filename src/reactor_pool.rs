//! A bounded collection of reactors with round-robin dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::{Error, Result};
use crate::pool::PoolId;
use crate::reactor::Reactor;
use crate::stats::ContextInfo;

pub struct ReactorPool {
    reactors: RwLock<Vec<Arc<Reactor>>>,
    cursor: AtomicUsize,
    max_size: usize,
}

impl ReactorPool {
    /// Create `initial_size` running reactors, with capacity for up to
    /// `max_size`.
    pub fn new(initial_size: usize, max_size: usize, threads_per_reactor: usize) -> Result<Self> {
        assert!(initial_size >= 1, "a reactor pool needs at least one reactor");
        assert!(max_size >= initial_size);

        let mut reactors = Vec::with_capacity(max_size);
        for index in 0..initial_size {
            let reactor = Reactor::new(index, threads_per_reactor)?;
            reactor.run();
            reactors.push(reactor);
        }

        Ok(Self {
            reactors: RwLock::new(reactors),
            cursor: AtomicUsize::new(0),
            max_size,
        })
    }

    /// The next active reactor, with its hold count already incremented.
    /// The caller must `unhold` once its transient setup step is done.
    /// Inactive entries are skipped; the pool's invariant that at least
    /// one reactor stays active makes the scan terminate.
    pub fn round_robin(&self) -> (Arc<Reactor>, PoolId) {
        let reactors = self.reactors.read().unwrap();
        loop {
            let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % reactors.len();
            let reactor = &reactors[slot];
            if reactor.is_active() {
                reactor.hold();
                return (reactor.clone(), slot as PoolId);
            }
        }
    }

    /// Add execution capacity: reuse a drained inactive reactor if one
    /// exists, otherwise append a new one.
    pub fn add(&self, threads: usize) -> Result<()> {
        let mut reactors = self.reactors.write().unwrap();

        for reactor in reactors.iter() {
            if reactor.reusable() {
                reactor.reuse(threads);
                info!(reactor = reactor.index(), threads, "reactor reactivated");
                return Ok(());
            }
        }

        if reactors.len() >= self.max_size {
            return Err(Error::ReactorPoolFull);
        }

        let index = reactors.len();
        let reactor = Reactor::new(index, threads)?;
        reactor.run();
        reactors.push(reactor);
        info!(reactor = index, threads, "reactor added");
        Ok(())
    }

    /// Deactivate the reactor at `index`. Returns the reactor's stop
    /// status (`0` or `EBUSY`). Naming a missing or inactive reactor, or
    /// the only active one, is surfaced as an error.
    pub fn deactivate(&self, index: usize) -> Result<i32> {
        let reactors = self.reactors.write().unwrap();

        let reactor = reactors
            .get(index)
            .ok_or_else(|| Error::InvalidReactor(format!("no reactor at index {index}")))?;

        if !reactor.is_active() {
            return Err(Error::InvalidReactor(format!(
                "reactor {index} is not active"
            )));
        }

        let active = reactors.iter().filter(|r| r.is_active()).count();
        if active < 2 {
            return Err(Error::InvalidReactor(
                "at least one reactor must stay active".into(),
            ));
        }

        Ok(reactor.stop(false))
    }

    pub fn stop_all(&self) {
        let reactors = self.reactors.write().unwrap();
        for reactor in reactors.iter() {
            reactor.stop(true);
        }
    }

    pub fn active_count(&self) -> usize {
        let reactors = self.reactors.read().unwrap();
        reactors.iter().filter(|r| r.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.reactors.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contexts_info(&self) -> Vec<ContextInfo> {
        let reactors = self.reactors.read().unwrap();
        reactors.iter().map(|r| r.context_info()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped_pool(pool: &ReactorPool) {
        pool.stop_all();
    }

    #[test]
    fn round_robin_cycles_and_holds() {
        let pool = ReactorPool::new(2, 4, 1).unwrap();

        let (a, a_id) = pool.round_robin();
        let (b, b_id) = pool.round_robin();
        let (c, c_id) = pool.round_robin();

        assert_ne!(a_id, b_id);
        assert_eq!(a_id, c_id);
        assert_eq!(a.context_info().context_index, c.context_info().context_index);

        // Each dispatch took a hold; a deactivation attempt is BUSY.
        assert_eq!(pool.deactivate(b_id as usize).unwrap(), libc::EBUSY);

        b.unhold();
        assert_eq!(pool.deactivate(b_id as usize).unwrap(), 0);

        a.unhold();
        c.unhold();
        stopped_pool(&pool);
    }

    #[test]
    fn round_robin_skips_inactive_reactors() {
        let pool = ReactorPool::new(2, 2, 1).unwrap();
        assert_eq!(pool.deactivate(0).unwrap(), 0);

        for _ in 0..4 {
            let (reactor, id) = pool.round_robin();
            assert_eq!(id, 1);
            reactor.unhold();
        }
        stopped_pool(&pool);
    }

    #[test]
    fn add_appends_until_capacity() {
        let pool = ReactorPool::new(1, 2, 1).unwrap();
        pool.add(1).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(matches!(pool.add(1), Err(Error::ReactorPoolFull)));
        stopped_pool(&pool);
    }

    #[test]
    fn add_prefers_reusing_a_deactivated_reactor() {
        let pool = ReactorPool::new(2, 2, 1).unwrap();
        assert_eq!(pool.deactivate(1).unwrap(), 0);
        assert_eq!(pool.active_count(), 1);

        // Capacity is full, but the stopped reactor is reusable.
        pool.add(2).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.active_count(), 2);
        stopped_pool(&pool);
    }

    #[test]
    fn deactivate_rejects_bad_targets() {
        let pool = ReactorPool::new(1, 2, 1).unwrap();
        assert!(matches!(
            pool.deactivate(5),
            Err(Error::InvalidReactor(_))
        ));
        // The only active reactor must stay.
        assert!(matches!(
            pool.deactivate(0),
            Err(Error::InvalidReactor(_))
        ));

        pool.add(1).unwrap();
        assert_eq!(pool.deactivate(0).unwrap(), 0);
        // Now inactive: a second deactivation is invalid.
        assert!(matches!(
            pool.deactivate(0),
            Err(Error::InvalidReactor(_))
        ));
        stopped_pool(&pool);
    }
}
