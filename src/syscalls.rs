//! Raw socket and epoll plumbing (Linux).

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;

/// Options applied to a listening socket at creation time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenOptions {
    pub reuse_address: bool,
    /// `Some(timeout_secs)` enables SO_LINGER with the given timeout.
    pub linger: Option<u32>,
}

/// Create a non-blocking TCP listener bound to `addr`.
///
/// TCP_NODELAY is set on the listener so accepted sockets inherit it.
pub fn create_listen_socket(addr: SocketAddr, opts: ListenOptions) -> io::Result<RawFd> {
    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: c_int = 1;
        if opts.reuse_address
            && libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if let Some(timeout) = opts.linger {
            let lg = libc::linger {
                l_onoff: 1,
                l_linger: timeout as c_int,
            };
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &lg as *const _ as *const c_void,
                mem::size_of_val(&lg) as socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
        }

        // Inherited by accepted sockets.
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        if let Err(err) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

fn bind_addr(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }
}

/// Accept one pending connection; `Ok(None)` when the queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<RawFd>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(fd))
        }
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// The locally-bound address of a socket.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }

        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &*(&storage as *const _ as *const libc::sockaddr_in);
                Ok(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let sin6 = &*(&storage as *const _ as *const libc::sockaddr_in6);
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected address family",
            )),
        }
    }
}

/// Non-blocking read. `Ok(0)` means the peer closed the connection;
/// a drained socket surfaces as `ErrorKind::WouldBlock`.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Non-blocking write; a full socket buffer surfaces as
/// `ErrorKind::WouldBlock`.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

pub type EpollEvent = libc::epoll_event;

pub fn zeroed_event() -> EpollEvent {
    EpollEvent { events: 0, u64: 0 }
}

pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    /// Register `fd` level-triggered. When `oneshot` is set the kernel
    /// disarms the registration after one event, which is what lets
    /// several threads wait on the same epoll instance and still dispatch
    /// each event exactly once.
    pub fn add(&self, fd: RawFd, token: u64, interests: u32, oneshot: bool) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests, oneshot)
    }

    pub fn modify(&self, fd: RawFd, token: u64, interests: u32, oneshot: bool) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests, oneshot)
    }

    fn ctl(
        &self,
        op: c_int,
        fd: RawFd,
        token: u64,
        interests: u32,
        oneshot: bool,
    ) -> io::Result<()> {
        let mut events = interests;
        if oneshot {
            events |= libc::EPOLLONESHOT as u32;
        }
        let mut event = libc::epoll_event {
            events,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                // The fd may already be gone (closed sockets deregister
                // themselves).
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Eventfd used to kick worker threads out of `epoll_wait` when a task is
/// posted or a stop is requested.
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.fd,
                &one as *const u64 as *const c_void,
                mem::size_of::<u64>(),
            );
        }
    }

    /// Reset the counter so the fd stops polling readable.
    pub fn drain(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut buf as *mut u64 as *mut c_void,
                mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_notify_and_drain() {
        let efd = EventFd::new().unwrap();
        let epoll = Epoll::new().unwrap();
        epoll.add(efd.raw(), 7, EPOLLIN, false).unwrap();

        let mut events = [zeroed_event(); 4];
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);

        efd.notify();
        let n = epoll.wait(&mut events, 100).unwrap();
        assert_eq!(n, 1);
        assert_eq!({ events[0].u64 }, 7);

        efd.drain();
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);
    }

    #[test]
    fn oneshot_registration_fires_once() {
        let efd = EventFd::new().unwrap();
        let epoll = Epoll::new().unwrap();
        epoll.add(efd.raw(), 1, EPOLLIN, true).unwrap();

        efd.notify();
        let mut events = [zeroed_event(); 4];
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);
        // Still readable, but the oneshot registration is disarmed.
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);

        // Re-arming delivers the still-pending readiness again.
        epoll.modify(efd.raw(), 1, EPOLLIN, true).unwrap();
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);
    }

    #[test]
    fn listener_accepts_nonblocking() {
        let fd = create_listen_socket(
            "127.0.0.1:0".parse().unwrap(),
            ListenOptions {
                reuse_address: true,
                linger: None,
            },
        )
        .unwrap();
        assert_eq!(accept_connection(fd).unwrap(), None);
        close_fd(fd);
    }
}
