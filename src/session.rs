//! Per-connection state machine.
//!
//! A `Session` owns a socket borrowed onto a reactor (optionally wrapped
//! in a strand), drives the receive → dispatch → send → close sequence,
//! and routes protocol callbacks through the [`Protocol`] seam. Sessions
//! are pooled: `finalize` hands the instance back through its finalize
//! callback exactly once per acquire cycle.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::buffer::{BufferPool, OutgoingQueue, QueueBuffer};
use crate::error::is_cancelled;
use crate::pool::{Pool, PoolId, Poolable};
use crate::reactor::Reactor;
use crate::stats::SessionStatsDelta;
use crate::sync::ResettableOnceFlag;
use crate::syscalls;

/// Per-operation transfer ceiling.
pub const MAX_TRANSFER: usize = 256 * 1024;

/// What a protocol callback wants the session to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// The input stream is complete; stop reading (writes may continue).
    Finished,
    /// Keep reading.
    Continue,
    /// Shut the connection down.
    Close,
    /// More outgoing data was queued; wait for the next write completion.
    Data,
}

/// The seam between the session and its protocol. One concrete protocol
/// exists today (HTTP), but the session stays generic over this interface.
pub trait Protocol: Send + 'static {
    fn start(&mut self, io: &mut SessionIo<'_, Self>)
    where
        Self: Sized;
    fn on_data(&mut self, io: &mut SessionIo<'_, Self>) -> Feedback
    where
        Self: Sized;
    fn on_sent(&mut self, io: &mut SessionIo<'_, Self>) -> Feedback
    where
        Self: Sized;
    fn on_error(&mut self, error: &io::Error);
    fn on_closed(&mut self);
    /// Attempt to parse the protocol's framing header from the buffered
    /// input; returns whether the header is now complete.
    fn try_handle_header(&mut self, io: &mut SessionIo<'_, Self>) -> bool
    where
        Self: Sized;
    fn id(&self) -> u64;
}

#[derive(Default)]
struct Core {
    socket: Option<RawFd>,
    reactor: Option<Arc<Reactor>>,
    strand: Option<Arc<crate::reactor::Strand>>,
    input: Vec<u8>,
    /// Total bytes this transaction is expected to carry, once declared.
    expected: Option<usize>,
    bytes_received: usize,
    bytes_sent: usize,
    /// In-flight read bookkeeping: minimum bytes the current operation
    /// must transfer and how many it has so far.
    read_min: usize,
    read_got: usize,
}

#[repr(align(64))]
pub struct Session<P: Protocol> {
    weak: Weak<Session<P>>,
    proto: Mutex<P>,
    core: Mutex<Core>,
    outgoing: OutgoingQueue,
    prepare_for_shutdown: AtomicBool,
    close_flag: ResettableOnceFlag,
    /// Set by `finalize_locked`; the finalize callback is delivered after
    /// the state locks are released, because the pool's pending waiter may
    /// restart this very session synchronously.
    finalize_pending: AtomicBool,
    /// Shared abort hint: protocols wire it into long-running work (VM
    /// lock waits) so a forced teardown can interrupt them.
    abort: Arc<AtomicBool>,
    /// Acquire-cycle counter. A posted close carries the cycle it was
    /// issued for, so a stale close cannot tear down the next connection
    /// served by this recycled session.
    cycle: AtomicU64,
    stats: SessionStatsDelta,
    finalized: Box<dyn Fn(Arc<Session<P>>) + Send + Sync>,
}

impl<P: Protocol> Session<P> {
    pub fn create(
        proto: P,
        finalized: Box<dyn Fn(Arc<Session<P>>) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Session {
            weak: weak.clone(),
            proto: Mutex::new(proto),
            core: Mutex::new(Core::default()),
            outgoing: OutgoingQueue::new(),
            prepare_for_shutdown: AtomicBool::new(false),
            close_flag: ResettableOnceFlag::new(),
            finalize_pending: AtomicBool::new(false),
            abort: Arc::new(AtomicBool::new(false)),
            cycle: AtomicU64::new(0),
            stats: SessionStatsDelta::default(),
            finalized,
        })
    }

    fn arc(&self) -> Arc<Session<P>> {
        self.weak.upgrade().expect("session dropped while in use")
    }

    pub fn stats_delta(&self) -> &SessionStatsDelta {
        &self.stats
    }

    /// Raise the abort hint without touching the state locks, so work
    /// blocked inside a protocol callback (VM lock waits) can unwind.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Attach a freshly-accepted socket. The session takes a reference on
    /// the reactor and borrows a strand when the reactor is multi-threaded.
    pub fn setup(&self, reactor: Arc<Reactor>, fd: RawFd) {
        let mut core = self.core.lock().unwrap();
        reactor.ref_session();
        core.strand = reactor.borrow_strand();
        core.reactor = Some(reactor);
        core.socket = Some(fd);
        core.read_min = 0;
        core.read_got = 0;
        self.abort.store(false, Ordering::SeqCst);
        self.prepare_for_shutdown.store(false, Ordering::SeqCst);
        self.cycle.fetch_add(1, Ordering::SeqCst);
        self.close_flag.reset();
    }

    /// Run the protocol's `start`, arm the first read, and release the
    /// dispatch hold on the reactor.
    pub fn session_start(&self) {
        {
            let mut proto = self.proto.lock().unwrap();
            let mut core = self.core.lock().unwrap();
            let reactor_for_unhold = core.reactor.clone();

            {
                let mut io = SessionIo {
                    session: self,
                    core: &mut core,
                };
                proto.start(&mut io);
            }
            self.async_receive(&mut proto, &mut core);

            if let Some(reactor) = reactor_for_unhold {
                reactor.unhold();
            }
        }
        self.deliver_finalize();
    }

    /// Schedule a read. The minimum transfer is 1 byte until an expected
    /// length is declared, then the remaining expected bytes capped at
    /// [`MAX_TRANSFER`]. Scheduling a read with nothing left to expect is
    /// a programming fault.
    fn async_receive(&self, proto: &mut P, core: &mut Core) {
        let fd = match core.socket {
            Some(fd) => fd,
            None => return,
        };

        let min = match core.expected {
            None => 1,
            Some(expected) => {
                let remaining = expected.saturating_sub(core.bytes_received);
                assert!(remaining > 0, "receive scheduled with no data expected");
                remaining.min(MAX_TRANSFER)
            }
        };
        core.read_min = min;
        core.read_got = 0;

        let session = self.arc();
        let reactor = core.reactor.clone().expect("session without reactor");
        reactor.register_read(fd, Box::new(move || session.on_readable()));

        // If the reactor stopped between scheduling and execution the
        // completion will never run; close synchronously to avoid a leak.
        if reactor.stopped() {
            self.close_once_locked(proto, core);
        }
    }

    fn on_readable(self: Arc<Self>) {
        {
            let mut proto = self.proto.lock().unwrap();
            let mut core = self.core.lock().unwrap();
            self.do_read(&mut proto, &mut core);
        }
        self.deliver_finalize();
    }

    fn do_read(&self, proto: &mut P, core: &mut Core) {
        let fd = match core.socket {
            Some(fd) => fd,
            None => return,
        };

        let result: Option<io::Result<()>> = loop {
            if core.read_got >= core.read_min || core.read_got >= MAX_TRANSFER {
                break Some(Ok(()));
            }

            let want = MAX_TRANSFER - core.read_got;
            let old_len = core.input.len();
            core.input.resize(old_len + want, 0);
            match syscalls::read_fd(fd, &mut core.input[old_len..old_len + want]) {
                Ok(0) => {
                    core.input.truncate(old_len);
                    break Some(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                Ok(n) => {
                    core.input.truncate(old_len + n);
                    core.read_got += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    core.input.truncate(old_len);
                    if core.read_got >= core.read_min {
                        break Some(Ok(()));
                    }
                    break None;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    core.input.truncate(old_len);
                }
                Err(e) => {
                    core.input.truncate(old_len);
                    break Some(Err(e));
                }
            }
        };

        match result {
            Some(Ok(())) => self.receive_event(proto, core),
            Some(Err(e)) => self.async_close(proto, core, Some(&e)),
            None => {
                // Not enough yet; re-arm and wait for the next readiness.
                let session = self.arc();
                let reactor = core.reactor.clone().expect("session without reactor");
                reactor.register_read(fd, Box::new(move || session.on_readable()));
                if reactor.stopped() {
                    self.close_once_locked(proto, core);
                }
            }
        }
    }

    fn receive_event(&self, proto: &mut P, core: &mut Core) {
        let got = core.read_got;
        core.read_got = 0;
        core.bytes_received += got;
        self.stats.bytes_received.fetch_add(got as u64, Ordering::Relaxed);

        let feedback = {
            let mut io = SessionIo {
                session: self,
                core: &mut *core,
            };
            proto.on_data(&mut io)
        };

        match feedback {
            Feedback::Continue => self.async_receive(proto, core),
            Feedback::Close => self.async_close(proto, core, None),
            Feedback::Finished | Feedback::Data => {}
        }
    }

    /// Start writing the outgoing queue's front buffer.
    fn async_send(&self, core: &mut Core) {
        let fd = match core.socket {
            Some(fd) => fd,
            None => return,
        };
        let session = self.arc();
        if let Some(reactor) = core.reactor.clone() {
            reactor.register_write(fd, Box::new(move || session.on_writable()));
        }
    }

    fn on_writable(self: Arc<Self>) {
        {
            let mut proto = self.proto.lock().unwrap();
            let mut core = self.core.lock().unwrap();
            self.do_write(&mut proto, &mut core);
        }
        self.deliver_finalize();
    }

    fn do_write(&self, proto: &mut P, core: &mut Core) {
        let fd = match core.socket {
            Some(fd) => fd,
            None => return,
        };

        loop {
            let (front, written) = match self.outgoing.front() {
                Some(front) => front,
                None => break,
            };

            let (result, front_done) = {
                let buf = front.lock().unwrap();
                let total = buf.len();
                if written >= total {
                    (Ok(0), true)
                } else {
                    match syscalls::write_fd(fd, &buf.as_slice()[written..]) {
                        Ok(n) => (Ok(n), written + n >= total),
                        Err(e) => (Err(e), false),
                    }
                }
            };

            match result {
                Ok(n) => {
                    self.outgoing.advance(n);
                    core.bytes_sent += n;
                    self.stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    if front_done {
                        self.outgoing.pop();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let session = self.arc();
                    if let Some(reactor) = core.reactor.clone() {
                        reactor.register_write(fd, Box::new(move || session.on_writable()));
                    }
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.outgoing.clear();
                    self.async_close(proto, core, Some(&e));
                    return;
                }
            }
        }

        // Queue fully drained: tell the protocol.
        let feedback = {
            let mut io = SessionIo {
                session: self,
                core: &mut *core,
            };
            proto.on_sent(&mut io)
        };

        match feedback {
            Feedback::Continue => self.async_receive(proto, core),
            Feedback::Close => self.async_close(proto, core, None),
            Feedback::Data => {}
            Feedback::Finished => unreachable!("on_sent returned Finished"),
        }

        // A shutdown deferred behind pending writes re-arms now.
        if self.prepare_for_shutdown.swap(false, Ordering::SeqCst) {
            self.async_close(proto, core, None);
        }
    }

    /// Report a non-cancelled error and schedule the close through the
    /// reactor (via the strand when one is attached).
    fn async_close(&self, proto: &mut P, core: &mut Core, error: Option<&io::Error>) {
        if let Some(e) = error {
            self.report_error(proto, e);
        }

        let session = self.arc();
        let cycle = self.cycle.load(Ordering::SeqCst);
        let task: crate::reactor::Task = Box::new(move || session.close_once_entry(cycle));

        match (core.strand.clone(), core.reactor.clone()) {
            (Some(strand), Some(reactor)) => {
                strand.post(&reactor, task);
                if reactor.stopped() {
                    self.close_once_locked(proto, core);
                }
            }
            (None, Some(reactor)) => {
                reactor.post(task);
                if reactor.stopped() {
                    self.close_once_locked(proto, core);
                }
            }
            // No reactor attached (already finalized); nothing to do.
            _ => {}
        }
    }

    fn close_once_entry(self: Arc<Self>, cycle: u64) {
        {
            let mut proto = self.proto.lock().unwrap();
            let mut core = self.core.lock().unwrap();
            // The session may have been finalized and re-acquired while
            // this task sat in the queue.
            if self.cycle.load(Ordering::SeqCst) != cycle {
                return;
            }
            self.close_once_locked(&mut proto, &mut core);
        }
        self.deliver_finalize();
    }

    /// At most one close goes through per acquire cycle. A close requested
    /// while the outgoing queue still holds data is deferred; the final
    /// write completion re-arms it.
    fn close_once_locked(&self, proto: &mut P, core: &mut Core) {
        if !self.outgoing.is_empty() {
            self.prepare_for_shutdown.store(true, Ordering::SeqCst);
            return;
        }

        self.close_flag.run_once(|| self.finalize_locked(proto, core));
    }

    fn finalize_locked(&self, proto: &mut P, core: &mut Core) {
        trace!(protocol = proto.id(), "session finalize");

        if let Some(fd) = core.socket.take() {
            if let Some(reactor) = core.reactor.as_ref() {
                reactor.deregister(fd);
            }
            syscalls::close_fd(fd);
        }

        proto.on_closed();

        if let Some(strand) = core.strand.take() {
            if let Some(reactor) = core.reactor.as_ref() {
                reactor.put_strand(strand);
            }
        }

        if let Some(reactor) = core.reactor.take() {
            reactor.deref_session();
        }

        self.finalize_pending.store(true, Ordering::Release);
    }

    /// Hand the session back through its finalize callback, outside the
    /// state locks.
    fn deliver_finalize(&self) {
        if self.finalize_pending.swap(false, Ordering::AcqRel) {
            (self.finalized)(self.arc());
        }
    }

    fn report_error(&self, proto: &mut P, error: &io::Error) {
        // Cancelled operations are shutdown noise, not protocol errors.
        if is_cancelled(error) {
            return;
        }
        proto.on_error(error);
    }
}

impl<P: Protocol> Poolable for Session<P> {
    /// Forced teardown used by `Pool::recover` when this session's reactor
    /// died. The abort hint is raised first so any blocked program work
    /// (VM lock waits) unwinds before we take the state locks.
    fn finalize(self: Arc<Self>) {
        self.abort.store(true, Ordering::SeqCst);
        {
            let mut proto = self.proto.lock().unwrap();
            let mut core = self.core.lock().unwrap();
            self.outgoing.clear();
            self.close_once_locked(&mut proto, &mut core);
        }
        self.deliver_finalize();
    }
}

/// The operations a protocol may perform on its session from inside a
/// callback.
pub struct SessionIo<'a, P: Protocol> {
    session: &'a Session<P>,
    core: &'a mut Core,
}

impl<P: Protocol> SessionIo<'_, P> {
    /// Queue a buffer for sending; an idle queue starts a write.
    pub fn send(&mut self, qb: QueueBuffer) {
        let was_idle = self.session.outgoing.push(qb);
        if was_idle {
            self.session.async_send(self.core);
        }
    }

    /// Discard `length` bytes from the input stream head (0 = all).
    pub fn consume(&mut self, length: usize) {
        if length == 0 {
            self.core.input.clear();
        } else {
            self.core.input.drain(..length.min(self.core.input.len()));
        }
    }

    pub fn prepare_send_buffer(&mut self, n: usize) -> QueueBuffer {
        BufferPool::global().borrow(n)
    }

    pub fn release_send_buffer(&mut self, qb: QueueBuffer) {
        BufferPool::global().put_back(qb);
    }

    pub fn data(&self) -> &[u8] {
        &self.core.input
    }

    pub fn data_size(&self) -> usize {
        self.core.input.len()
    }

    /// Declare the total number of bytes this transaction will carry
    /// (framing header included). Enables optimised reads and
    /// `check_finished`.
    pub fn set_expected_data_length(&mut self, total: usize) {
        self.core.expected = Some(total);
    }

    pub fn bytes_received(&self) -> usize {
        self.core.bytes_received
    }

    /// True once the declared expected length has been fully received.
    pub fn check_finished(&self) -> bool {
        match self.core.expected {
            Some(expected) => self.core.bytes_received >= expected,
            None => false,
        }
    }

    /// Clear input state and counters between keep-alive transactions.
    pub fn reset_buffers(&mut self) {
        self.core.expected = None;
        self.core.bytes_received = 0;
        self.core.bytes_sent = 0;
        self.core.input.clear();
    }

    pub fn transaction_started(&mut self) {
        self.session
            .stats
            .transactions
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Cancellation hint shared with the session's forced-teardown path;
    /// protocols wire it into interruptible blocking work.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.session.abort.clone()
    }
}

/// Pool of sessions whose `create` pre-equips every instance with a
/// finalize callback that re-pools it.
pub struct SessionPool<P: Protocol + Default> {
    pool: Arc<Pool<Session<P>>>,
}

impl<P: Protocol + Default> SessionPool<P> {
    pub fn new(max_size: usize, eager: bool) -> Self {
        let pool = Arc::new_cyclic(|weak: &Weak<Pool<Session<P>>>| {
            let weak = weak.clone();
            Pool::new(
                max_size,
                eager,
                Box::new(move || {
                    let weak = weak.clone();
                    Session::create(
                        P::default(),
                        Box::new(move |session| {
                            if let Some(pool) = weak.upgrade() {
                                pool.put_back(session);
                            }
                        }),
                    )
                }),
            )
        });
        Self { pool }
    }

    pub fn borrow(&self, id: PoolId) -> Option<Arc<Session<P>>> {
        self.pool.borrow(id)
    }

    pub fn recover(&self, id: PoolId) {
        debug!(reactor = id, "recovering sessions");
        self.pool.recover(id);
    }

    pub fn total(&self) -> usize {
        self.pool.stats().total()
    }

    pub fn in_flight(&self) -> usize {
        self.pool.stats().in_flight()
    }

    /// Raise every session's abort hint. Called ahead of a forced reactor
    /// stop so blocked handlers drain promptly.
    pub fn interrupt_all(&self) {
        self.pool.for_each_item(|session| session.request_abort());
    }

    /// Sum and reset every session's delta counters.
    pub fn aggregate_deltas(&self) -> (u64, u64, u64) {
        let mut transactions = 0;
        let mut bytes_received = 0;
        let mut bytes_sent = 0;
        self.pool.for_each_item(|session| {
            let (t, r, s) = session.stats_delta().take();
            transactions += t;
            bytes_received += r;
            bytes_sent += s;
        });
        (transactions, bytes_received, bytes_sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::IntoRawFd;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Swallows one chunk of input and asks for a close.
    #[derive(Default)]
    struct CloseAfterFirstChunk {
        closed: Arc<AtomicBool>,
    }

    impl Protocol for CloseAfterFirstChunk {
        fn start(&mut self, io: &mut SessionIo<'_, Self>) {
            io.reset_buffers();
        }

        fn on_data(&mut self, _io: &mut SessionIo<'_, Self>) -> Feedback {
            Feedback::Close
        }

        fn on_sent(&mut self, _io: &mut SessionIo<'_, Self>) -> Feedback {
            Feedback::Close
        }

        fn on_error(&mut self, _error: &io::Error) {}

        fn on_closed(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn try_handle_header(&mut self, _io: &mut SessionIo<'_, Self>) -> bool {
            true
        }

        fn id(&self) -> u64 {
            0
        }
    }

    #[test]
    fn session_lifecycle_closes_and_finalizes_once() {
        let reactor = Reactor::new(0, 2).unwrap();
        reactor.run();

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let session = Session::create(
            CloseAfterFirstChunk {
                closed: closed.clone(),
            },
            Box::new(move |_s| tx.lock().unwrap().send(()).unwrap()),
        );

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        reactor.hold();
        session.setup(reactor.clone(), accepted.into_raw_fd());
        session.session_start();

        client.write_all(b"ping").unwrap();

        // Finalize must be delivered exactly once.
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        // The session released its reactor reference.
        assert_eq!(reactor.context_info().active_sessions, 0);
        assert_eq!(reactor.stop(true), 0);
    }

    #[test]
    fn recover_finalizes_a_session_on_a_dead_reactor() {
        let reactor = Reactor::new(0, 1).unwrap();
        reactor.run();

        let pool: SessionPool<CloseAfterFirstChunk> = SessionPool::new(4, false);
        let session = pool.borrow(0).unwrap();
        assert_eq!(pool.in_flight(), 1);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        reactor.hold();
        session.setup(reactor.clone(), accepted.into_raw_fd());
        session.session_start();

        // Kill the reactor with the session still attached, then rescue.
        assert_eq!(reactor.stop(true), 0);
        pool.recover(0);

        assert_eq!(pool.in_flight(), 0);
        assert_eq!(reactor.context_info().active_sessions, 0);
    }
}
