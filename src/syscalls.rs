// src/syscalls.rs
use crate::error::MazurkaResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// ---- Socket Operations ----

/// Create a non-blocking TCP listener socket with SO_REUSEADDR and
/// SO_REUSEPORT, bound and listening. Port 0 asks the kernel for a free port
/// (query it back with `local_port`).
pub fn create_listen_socket(host: &str, port: u16) -> MazurkaResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

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
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
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
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Port the socket is actually bound to. Needed when binding port 0.
pub fn local_port(fd: c_int) -> MazurkaResult<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &storage as *const _ as *const libc::sockaddr_in;
                Ok(u16::from_be((*sin).sin_port))
            }
            libc::AF_INET6 => {
                let sin6 = &storage as *const _ as *const libc::sockaddr_in6;
                Ok(u16::from_be((*sin6).sin6_port))
            }
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unknown address family").into()),
        }
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// Accept one pending connection, non-blocking.
///
/// Returns `Ok(None)` when no connection is pending (the poller will
/// re-notify), otherwise the new descriptor and the peer address.
pub fn accept_connection(listen_fd: c_int) -> MazurkaResult<Option<(c_int, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            let peer = sockaddr_to_addr(&storage)
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
            Ok(Some((fd, peer)))
        }
    }
}

/// Half-close the write side (FIN after pending bytes drain).
pub fn shutdown_write(fd: c_int) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Non-blocking I/O ----
//
// These return the raw io::Error so callers can tell transient conditions
// (WouldBlock / Interrupted) from real failures; the two are different
// lifecycle paths, not different severities.

pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Vectored read into two segments in a single syscall (scatter-gather I/O).
/// Returns Ok(0) on orderly peer close.
pub fn readv_nonblocking(fd: c_int, a: &mut [u8], b: &mut [u8]) -> io::Result<usize> {
    let iovecs = [
        libc::iovec {
            iov_base: a.as_mut_ptr() as *mut c_void,
            iov_len: a.len(),
        },
        libc::iovec {
            iov_base: b.as_mut_ptr() as *mut c_void,
            iov_len: b.len(),
        },
    ];
    // Skip the scratch segment when the first one is already large enough to
    // absorb a full read on its own.
    let iovcnt = if a.len() >= b.len() { 1 } else { 2 };

    unsafe {
        let res = libc::readv(fd, iovecs.as_ptr(), iovcnt as c_int);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Eventfd (cross-thread loop wakeup) ----

pub fn create_eventfd() -> MazurkaResult<c_int> {
    unsafe {
        let fd = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}

/// Bump the eventfd counter; safe from any thread.
pub fn eventfd_signal(fd: c_int) {
    let one: u64 = 1;
    unsafe {
        libc::write(fd, &one as *const u64 as *const c_void, 8);
    }
}

/// Reset the eventfd counter so level-triggered polling quiesces.
pub fn eventfd_drain(fd: c_int) {
    let mut count: u64 = 0;
    unsafe {
        libc::read(fd, &mut count as *mut u64 as *mut c_void, 8);
    }
}

// ---- Epoll Operations ----

pub use libc::epoll_event;

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> MazurkaResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register a descriptor, level-triggered. The token comes back in
    /// `epoll_event.u64` on readiness.
    pub fn add(&self, fd: c_int, token: u64, interests: u32) -> MazurkaResult<()> {
        let mut event = epoll_event {
            events: interests,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn modify(&self, fd: c_int, token: u64, interests: u32) -> MazurkaResult<()> {
        let mut event = epoll_event {
            events: interests,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> MazurkaResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> MazurkaResult<usize> {
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
                return Err(err.into());
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
