//! A server: listener, acceptor loop, reactor pool, and session pool.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, Weak};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::PoolId;
use crate::reactor::Reactor;
use crate::reactor_pool::ReactorPool;
use crate::session::{Protocol, SessionPool};
use crate::stats::{now_micros, ContextInfo, ServerStats, StatsSnapshot};
use crate::sync::TriggerGuard;
use crate::syscalls::{self, ListenOptions};

/// The administrative surface a server exposes to the manager,
/// independent of its protocol type.
pub trait AbstractServer: Send + Sync {
    fn stop(&self);
    fn wait(&self);
    fn add_context(&self, threads: usize) -> Result<()>;
    fn deactivate_context(&self, index: usize) -> Result<i32>;
    fn contexts_info(&self) -> Vec<ContextInfo>;
    fn snapshot(&self) -> StatsSnapshot;
}

pub struct Server<P: Protocol + Default> {
    weak: Weak<Server<P>>,
    workers: ReactorPool,
    sessions: SessionPool<P>,
    /// Private single-reactor pool for the acceptor when
    /// `separate_acceptor_thread` is configured.
    acceptor_pool: Option<ReactorPool>,
    /// The reactor driving accepts. It carries a permanent hold for the
    /// server's lifetime, so it can never be deactivated underneath the
    /// listener.
    acceptor_reactor: Arc<Reactor>,
    listen_fd: RawFd,
    shutdown_guard: TriggerGuard,
    /// The reactor held by the currently-armed accept, so `stop` can
    /// release the hold that accept will never complete.
    pending_dispatch: Mutex<Option<Arc<Reactor>>>,
    stats: ServerStats,
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
}

impl<P: Protocol + Default> Server<P> {
    pub fn create(config: &Config) -> Result<Arc<Self>> {
        let workers = ReactorPool::new(
            config.concurrency.num_workers,
            config.concurrency.max_num_workers,
            config.concurrency.num_threads_per_worker,
        )?;
        let sessions = SessionPool::new(
            config.sessions.max_session_pool_size,
            config.sessions.eager_session_pool,
        );

        let (acceptor_pool, acceptor_reactor) = if config.listen.separate_acceptor_thread {
            let pool = ReactorPool::new(1, 1, 1)?;
            let (reactor, _) = pool.round_robin();
            (Some(pool), reactor)
        } else {
            let (reactor, _) = workers.round_robin();
            (None, reactor)
        };

        let addr: SocketAddr = format!("{}:{}", config.listen.ip, config.listen.port)
            .parse()
            .map_err(|e| Error::Config(format!("listen address: {e}")))?;
        let listen_fd = syscalls::create_listen_socket(
            addr,
            ListenOptions {
                reuse_address: config.listen.reuse_address,
                linger: config
                    .networking
                    .socket_close_linger
                    .then_some(config.networking.socket_close_linger_timeout),
            },
        )?;
        info!(%addr, "listening");

        Ok(Arc::new_cyclic(|weak| Server {
            weak: weak.clone(),
            workers,
            sessions,
            acceptor_pool,
            acceptor_reactor,
            listen_fd,
            shutdown_guard: TriggerGuard::new(),
            pending_dispatch: Mutex::new(None),
            stats: ServerStats::default(),
            stopped: Mutex::new(false),
            stopped_cv: Condvar::new(),
        }))
    }

    fn arc(&self) -> Arc<Server<P>> {
        self.weak.upgrade().expect("server dropped while in use")
    }

    /// Select a reactor for the next connection and arm an accept on it.
    /// Never blocks. A triggered guard means the server is shutting down,
    /// so the accept chain simply ends here.
    pub fn dispatch(&self) {
        let guard = match self.shutdown_guard.acquire() {
            Some(guard) => guard,
            None => return,
        };

        let (target, target_id) = self.workers.round_robin();
        *self.pending_dispatch.lock().unwrap() = Some(target.clone());

        let server = self.arc();
        self.acceptor_reactor.register_read(
            self.listen_fd,
            Box::new(move || server.on_accept_ready(target, target_id)),
        );
        drop(guard);
    }

    fn on_accept_ready(self: Arc<Self>, target: Arc<Reactor>, target_id: PoolId) {
        {
            let guard = match self.shutdown_guard.acquire() {
                Some(guard) => guard,
                None => {
                    target.unhold();
                    return;
                }
            };
            *self.pending_dispatch.lock().unwrap() = None;

            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some(fd)) => match self.sessions.borrow(target_id) {
                    Some(session) => {
                        session.setup(target, fd);
                        // session_start runs the protocol's start, arms the
                        // first read, and releases the dispatch hold.
                        session.session_start();
                        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        // Bounded pool exhausted: the socket is dropped.
                        debug!("session pool exhausted, dropping connection");
                        syscalls::close_fd(fd);
                        target.unhold();
                    }
                },
                Ok(None) => target.unhold(),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    target.unhold();
                }
            }
            drop(guard);
        }

        // Immediately schedule the next accept.
        self.dispatch();
    }

    pub fn sessions(&self) -> &SessionPool<P> {
        &self.sessions
    }

    /// The address the listener is bound to (useful when the configured
    /// port was 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(syscalls::local_addr(self.listen_fd)?)
    }
}

impl<P: Protocol + Default> AbstractServer for Server<P> {
    fn stop(&self) {
        // Wait out any in-flight accept registration, then refuse new
        // ones.
        self.shutdown_guard.trigger();

        self.acceptor_reactor.deregister(self.listen_fd);
        syscalls::close_fd(self.listen_fd);

        // The armed accept will never complete; release its hold, along
        // with the lifetime hold on the acceptor's reactor.
        if let Some(target) = self.pending_dispatch.lock().unwrap().take() {
            target.unhold();
        }
        self.acceptor_reactor.unhold();

        if let Some(pool) = &self.acceptor_pool {
            pool.stop_all();
        }
        // Unblock handlers stuck in program work before joining the
        // worker threads.
        self.sessions.interrupt_all();
        self.workers.stop_all();
        info!("workers pool stopped");

        // Sessions stranded on the stopped reactors are finalized and
        // returned to the pool.
        for id in 0..self.workers.len() {
            self.sessions.recover(id as PoolId);
        }

        *self.stopped.lock().unwrap() = true;
        self.stopped_cv.notify_all();
    }

    fn wait(&self) {
        let mut stopped = self.stopped.lock().unwrap();
        while !*stopped {
            stopped = self.stopped_cv.wait(stopped).unwrap();
        }
    }

    fn add_context(&self, threads: usize) -> Result<()> {
        self.workers.add(threads)
    }

    fn deactivate_context(&self, index: usize) -> Result<i32> {
        let rc = self.workers.deactivate(index)?;
        if rc == 0 {
            self.sessions.recover(index as PoolId);
        }
        Ok(rc)
    }

    fn contexts_info(&self) -> Vec<ContextInfo> {
        self.workers.contexts_info()
    }

    fn snapshot(&self) -> StatsSnapshot {
        let (transactions, bytes_received, bytes_sent) = self.sessions.aggregate_deltas();
        StatsSnapshot {
            timestamp_micros: now_micros(),
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            pool_total: self.sessions.total(),
            pool_in_flight: self.sessions.in_flight(),
            transactions_delta: transactions,
            bytes_received_delta: bytes_received,
            bytes_sent_delta: bytes_sent,
        }
    }
}
