//! A reactor is one epoll instance plus a posted-task queue, driven by N
//! worker threads. Sessions register read/write readiness interest and
//! post closures; a work guard keeps the threads alive across idle
//! periods. Reactors can be stopped (joining their threads and rebuilding
//! a fresh driver) and later reused with a new thread count.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use tracing::{debug, trace, warn};

use crate::pool::{Pool, Poolable};
use crate::stats::ContextInfo;
use crate::syscalls::{self, Epoll, EventFd};

pub type Task = Box<dyn FnOnce() + Send>;

const WAKER_TOKEN: u64 = u64::MAX;
const EVENT_BATCH: usize = 256;
const WAIT_SLICE_MS: i32 = 100;

/// Serialising wrapper over posted closures: tasks submitted through one
/// strand run one at a time regardless of which worker thread picks them
/// up.
#[derive(Default)]
pub struct Strand {
    inner: Mutex<StrandQueue>,
}

#[derive(Default)]
struct StrandQueue {
    queue: VecDeque<Task>,
    executing: bool,
}

impl Strand {
    pub fn post(self: Arc<Self>, reactor: &Reactor, task: Task) {
        let start_drain = {
            let mut q = self.inner.lock().unwrap();
            q.queue.push_back(task);
            if q.executing {
                false
            } else {
                q.executing = true;
                true
            }
        };

        if start_drain {
            reactor.post(Box::new(move || self.drain()));
        }
    }

    fn drain(&self) {
        loop {
            let task = {
                let mut q = self.inner.lock().unwrap();
                match q.queue.pop_front() {
                    Some(t) => t,
                    None => {
                        q.executing = false;
                        return;
                    }
                }
            };
            task();
        }
    }
}

impl Poolable for Strand {}

/// The epoll instance and its waker; rebuilt wholesale on `stop` so a
/// reused reactor starts from a clean driver.
struct DriverSlot {
    epoll: Arc<Epoll>,
    waker: Arc<EventFd>,
}

impl DriverSlot {
    fn new() -> std::io::Result<Self> {
        let epoll = Arc::new(Epoll::new()?);
        let waker = Arc::new(EventFd::new()?);
        epoll.add(waker.raw(), WAKER_TOKEN, syscalls::EPOLLIN, false)?;
        Ok(Self { epoll, waker })
    }
}

#[derive(Default)]
struct IoEntry {
    read: Option<Task>,
    write: Option<Task>,
    /// Whether the fd has ever been added to the current epoll instance.
    added: bool,
}

pub struct Reactor {
    index: usize,
    /// Self-handle so worker threads and posted closures can keep the
    /// reactor alive.
    weak: Weak<Reactor>,
    driver: Mutex<DriverSlot>,
    io: Mutex<HashMap<RawFd, IoEntry>>,
    tasks: Mutex<VecDeque<Task>>,
    /// Armed readiness interests; part of the "no outstanding work" exit
    /// condition when the work guard is released.
    outstanding: AtomicUsize,
    work_guard: AtomicBool,
    stop_requested: AtomicBool,
    running: AtomicBool,
    active: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    num_threads: AtomicUsize,
    strand_pool: Pool<Strand>,
    ref_cnt: AtomicUsize,
    hold_cnt: AtomicUsize,
    /// Serialises stop/reuse transitions.
    lifecycle: Mutex<()>,
}

impl Reactor {
    pub fn new(index: usize, num_threads: usize) -> std::io::Result<Arc<Self>> {
        assert!(
            (1..=64).contains(&num_threads),
            "thread multiplier must be in 1..=64"
        );
        let driver = DriverSlot::new()?;
        Ok(Arc::new_cyclic(|weak| Self {
            index,
            weak: weak.clone(),
            driver: Mutex::new(driver),
            io: Mutex::new(HashMap::new()),
            tasks: Mutex::new(VecDeque::new()),
            outstanding: AtomicUsize::new(0),
            work_guard: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            active: AtomicBool::new(true),
            threads: Mutex::new(Vec::new()),
            num_threads: AtomicUsize::new(num_threads),
            strand_pool: Pool::new(0, false, Box::new(|| Arc::new(Strand::default()))),
            ref_cnt: AtomicUsize::new(0),
            hold_cnt: AtomicUsize::new(0),
            lifecycle: Mutex::new(()),
        }))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn arc(&self) -> Arc<Reactor> {
        self.weak.upgrade().expect("reactor dropped while in use")
    }

    /// Start the worker threads.
    pub fn run(&self) {
        let _lc = self.lifecycle.lock().unwrap();
        self.running.store(true, Ordering::SeqCst);
        self.spawn_threads(self.num_threads.load(Ordering::SeqCst));
    }

    fn spawn_threads(&self, count: usize) {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let (epoll, waker) = {
            let d = self.driver.lock().unwrap();
            (d.epoll.clone(), d.waker.clone())
        };

        let mut threads = self.threads.lock().unwrap();
        for j in 0..count {
            let reactor = self.arc();
            let epoll = epoll.clone();
            let waker = waker.clone();
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[(self.index + j) % core_ids.len()])
            };

            let handle = std::thread::Builder::new()
                .name(format!("loadsim-reactor-{}-{}", self.index, j))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    reactor.worker_loop(&epoll, &waker);
                })
                .expect("failed to spawn reactor worker thread");
            threads.push(handle);
        }
        debug!(reactor = self.index, threads = count, "reactor running");
    }

    fn worker_loop(&self, epoll: &Epoll, waker: &EventFd) {
        let mut events = vec![syscalls::zeroed_event(); EVENT_BATCH];

        loop {
            self.run_ready_tasks();

            if self.stop_requested.load(Ordering::Acquire) {
                break;
            }
            // With the work guard released the thread may retire once no
            // task or armed registration remains.
            if !self.work_guard.load(Ordering::Acquire)
                && self.outstanding.load(Ordering::Acquire) == 0
                && self.tasks.lock().unwrap().is_empty()
            {
                break;
            }

            let n = match epoll.wait(&mut events, WAIT_SLICE_MS) {
                Ok(n) => n,
                Err(e) => {
                    warn!(reactor = self.index, error = %e, "epoll_wait failed");
                    continue;
                }
            };

            for ev in events[..n].iter().copied() {
                if ev.u64 == WAKER_TOKEN {
                    waker.drain();
                    continue;
                }
                self.dispatch(epoll, ev.u64 as RawFd, ev.events);
            }
        }
        trace!(reactor = self.index, "worker thread exiting");
    }

    fn run_ready_tasks(&self) {
        loop {
            let task = self.tasks.lock().unwrap().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    fn dispatch(&self, epoll: &Epoll, fd: RawFd, events: u32) {
        let hangup = events & (syscalls::EPOLLERR | syscalls::EPOLLHUP) != 0;
        let (read_cb, write_cb) = {
            let mut io = self.io.lock().unwrap();
            let entry = match io.get_mut(&fd) {
                Some(entry) => entry,
                None => return,
            };

            let read_cb = if hangup || events & syscalls::EPOLLIN != 0 {
                entry.read.take()
            } else {
                None
            };
            let write_cb = if hangup || events & syscalls::EPOLLOUT != 0 {
                entry.write.take()
            } else {
                None
            };

            // Oneshot disarmed the whole fd; re-arm whatever interest is
            // still pending.
            let mut interests = 0;
            if entry.read.is_some() {
                interests |= syscalls::EPOLLIN;
            }
            if entry.write.is_some() {
                interests |= syscalls::EPOLLOUT;
            }
            if interests != 0 {
                let _ = epoll.modify(fd, fd as u64, interests, true);
            }

            (read_cb, write_cb)
        };

        if let Some(cb) = read_cb {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            cb();
        }
        if let Some(cb) = write_cb {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            cb();
        }
    }

    /// Arm read-readiness interest for `fd`; `cb` runs once, on any worker
    /// thread, when the socket is readable (or in error).
    pub fn register_read(&self, fd: RawFd, cb: Task) {
        self.register(fd, cb, true);
    }

    pub fn register_write(&self, fd: RawFd, cb: Task) {
        self.register(fd, cb, false);
    }

    fn register(&self, fd: RawFd, cb: Task, read: bool) {
        let mut io = self.io.lock().unwrap();
        let entry = io.entry(fd).or_default();
        let slot = if read { &mut entry.read } else { &mut entry.write };
        debug_assert!(slot.is_none(), "one in-flight operation per direction");
        *slot = Some(cb);
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        let mut interests = 0;
        if entry.read.is_some() {
            interests |= syscalls::EPOLLIN;
        }
        if entry.write.is_some() {
            interests |= syscalls::EPOLLOUT;
        }

        let driver = self.driver.lock().unwrap();
        let result = if entry.added {
            driver.epoll.modify(fd, fd as u64, interests, true)
        } else {
            entry.added = true;
            driver.epoll.add(fd, fd as u64, interests, true)
        };
        if let Err(e) = result {
            debug!(reactor = self.index, fd, error = %e, "epoll registration failed");
        }
    }

    /// Drop all interest in `fd`. Callbacks that were still armed are
    /// discarded.
    pub fn deregister(&self, fd: RawFd) {
        let mut io = self.io.lock().unwrap();
        if let Some(entry) = io.remove(&fd) {
            let mut armed = 0;
            if entry.read.is_some() {
                armed += 1;
            }
            if entry.write.is_some() {
                armed += 1;
            }
            if armed > 0 {
                self.outstanding.fetch_sub(armed, Ordering::AcqRel);
            }
            if entry.added {
                let driver = self.driver.lock().unwrap();
                let _ = driver.epoll.delete(fd);
            }
        }
    }

    /// Queue a closure to run on a worker thread.
    pub fn post(&self, task: Task) {
        self.tasks.lock().unwrap().push_back(task);
        self.driver.lock().unwrap().waker.notify();
    }

    /// `None` when a single thread drives this reactor (no serialisation
    /// needed); a pooled strand otherwise.
    pub fn borrow_strand(&self) -> Option<Arc<Strand>> {
        if self.num_threads.load(Ordering::SeqCst) == 1 {
            return None;
        }
        self.strand_pool.borrow(0)
    }

    pub fn put_strand(&self, strand: Arc<Strand>) {
        self.strand_pool.put_back(strand);
    }

    pub fn hold(&self) {
        self.hold_cnt.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unhold(&self) {
        let prev = self.hold_cnt.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    pub fn ref_session(&self) {
        self.ref_cnt.fetch_add(1, Ordering::SeqCst);
    }

    pub fn deref_session(&self) {
        let prev = self.ref_cnt.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// True while worker threads are (or should be) driving the reactor.
    /// Sessions probe this after scheduling async work: a stopped reactor
    /// will never run their completion, so they must close synchronously.
    pub fn stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    /// Deactivate the reactor. Refuses with `EBUSY` while administrative
    /// holds are outstanding unless `force` is set. On success the worker
    /// threads are joined, leftover queued tasks run on the calling
    /// thread, stale registrations are dropped, and a fresh driver is
    /// built ready for `reuse`. The strand pool is retained so strands
    /// still borrowed by draining sessions can find their way home.
    pub fn stop(&self, force: bool) -> i32 {
        let _lc = self.lifecycle.lock().unwrap();

        if self.hold_cnt.load(Ordering::SeqCst) > 0 && !force {
            return libc::EBUSY;
        }

        self.active.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.work_guard.store(false, Ordering::SeqCst);
        if force {
            self.stop_requested.store(true, Ordering::SeqCst);
        }
        self.driver.lock().unwrap().waker.notify();

        let threads: Vec<JoinHandle<()>> = self.threads.lock().unwrap().drain(..).collect();
        for t in threads {
            let _ = t.join();
        }

        // Run-to-completion for whatever was still queued (a posted close
        // may queue further work while draining).
        self.run_ready_tasks();

        self.io.lock().unwrap().clear();
        self.outstanding.store(0, Ordering::SeqCst);

        match DriverSlot::new() {
            Ok(fresh) => *self.driver.lock().unwrap() = fresh,
            Err(e) => warn!(reactor = self.index, error = %e, "driver rebuild failed"),
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        debug!(reactor = self.index, force, "reactor stopped");
        0
    }

    /// True when the reactor is inactive and fully drained of sessions,
    /// making it eligible for `reuse`.
    pub fn reusable(&self) -> bool {
        !self.active.load(Ordering::SeqCst) && self.ref_cnt.load(Ordering::SeqCst) == 0
    }

    /// Reactivate a stopped reactor with a new thread count.
    pub fn reuse(&self, num_threads: usize) {
        assert!(
            (1..=64).contains(&num_threads),
            "thread multiplier must be in 1..=64"
        );
        {
            let _lc = self.lifecycle.lock().unwrap();
            self.num_threads.store(num_threads, Ordering::SeqCst);
            self.work_guard.store(true, Ordering::SeqCst);
            self.stop_requested.store(false, Ordering::SeqCst);
            self.active.store(true, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            self.spawn_threads(num_threads);
        }
        debug!(reactor = self.index, threads = num_threads, "reactor reused");
    }

    pub fn context_info(&self) -> ContextInfo {
        let strand_stats = self.strand_pool.stats();
        ContextInfo {
            context_index: self.index,
            threads: self.num_threads.load(Ordering::SeqCst),
            active_sessions: self.ref_cnt.load(Ordering::SeqCst),
            strand_pool_size: strand_stats.total(),
            strand_pool_in_flight: strand_stats.in_flight(),
            active: self.is_active(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn posted_tasks_run_on_worker_threads() {
        let reactor = Reactor::new(0, 1).unwrap();
        reactor.run();

        let (tx, rx) = mpsc::channel();
        reactor.post(Box::new(move || tx.send(42).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);

        assert_eq!(reactor.stop(true), 0);
    }

    #[test]
    fn strand_serialises_posted_closures() {
        let reactor = Reactor::new(0, 4).unwrap();
        reactor.run();

        let strand = reactor.borrow_strand().expect("multi-threaded reactor");
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let in_flight = in_flight.clone();
            let overlaps = overlaps.clone();
            let done = done.clone();
            strand.clone().post(
                &reactor,
                Box::new(move || {
                    if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_micros(200));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while done.load(Ordering::SeqCst) < 64 {
            assert!(std::time::Instant::now() < deadline, "strand tasks stalled");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);

        reactor.put_strand(strand);
        assert_eq!(reactor.stop(true), 0);
    }

    #[test]
    fn single_threaded_reactor_has_no_strands() {
        let reactor = Reactor::new(0, 1).unwrap();
        assert!(reactor.borrow_strand().is_none());
    }

    #[test]
    fn stop_respects_holds() {
        let reactor = Reactor::new(0, 1).unwrap();
        reactor.run();

        reactor.hold();
        assert_eq!(reactor.stop(false), libc::EBUSY);
        assert!(reactor.is_active());

        reactor.unhold();
        assert_eq!(reactor.stop(false), 0);
        assert!(!reactor.is_active());
        assert!(reactor.stopped());
    }

    #[test]
    fn stopped_reactor_is_reusable_and_runs_again() {
        let reactor = Reactor::new(0, 1).unwrap();
        reactor.run();
        assert_eq!(reactor.stop(false), 0);
        assert!(reactor.reusable());

        reactor.reuse(2);
        assert!(reactor.is_active());
        assert!(!reactor.stopped());
        assert!(reactor.borrow_strand().is_some());

        let (tx, rx) = mpsc::channel();
        reactor.post(Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);

        assert_eq!(reactor.stop(true), 0);
    }

    #[test]
    fn attached_sessions_make_a_reactor_not_reusable() {
        let reactor = Reactor::new(0, 1).unwrap();
        reactor.run();
        reactor.ref_session();
        assert_eq!(reactor.stop(true), 0);
        assert!(!reactor.reusable());
        reactor.deref_session();
        assert!(reactor.reusable());
    }
}
