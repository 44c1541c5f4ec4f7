// src/syscalls.rs
use crate::error::EtudeResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking TCP listener bound to 0.0.0.0:port with
/// SO_REUSEADDR + SO_REUSEPORT set.
pub fn create_listen_socket(port: u16) -> EtudeResult<c_int> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
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

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(Ipv4Addr::UNSPECIFIED.octets()),
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

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Accept one pending connection, non-blocking. `Ok(None)` means the
/// kernel's pending queue is drained.
pub fn accept_connection(listen_fd: c_int) -> EtudeResult<Option<(c_int, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err.into())
        }
    } else {
        Ok(Some((fd, sockaddr_to_addr(&storage))))
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> SocketAddr {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            // SAFETY: ss_family says this storage holds a sockaddr_in.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            ))
        }
        libc::AF_INET6 => {
            // SAFETY: ss_family says this storage holds a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            ))
        }
        _ => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
    }
}

// ---- Epoll Operations ----

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Add a file descriptor to epoll. Always edge-triggered (EPOLLET).
    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> EtudeResult<()> {
        let mut event = libc::epoll_event {
            events: (interests | libc::EPOLLET) as u32,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> EtudeResult<()> {
        let mut event = libc::epoll_event {
            events: (interests | libc::EPOLLET) as u32,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> EtudeResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Register a freshly accepted client: oneshot read + peer-hangup
    /// interest. The token is the fd itself.
    pub fn register_client(&self, fd: c_int) -> EtudeResult<()> {
        self.add(fd, fd as u64, libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLONESHOT)
    }

    /// Re-arm read interest after a delivered event has been fully handled.
    /// Exactly one re-arm per delivered event: this is the connection's only
    /// state-advancement mechanism.
    pub fn rearm_read(&self, fd: c_int) -> EtudeResult<()> {
        self.modify(fd, fd as u64, libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLONESHOT)
    }

    /// Re-arm write interest, same contract as `rearm_read`.
    pub fn rearm_write(&self, fd: c_int) -> EtudeResult<()> {
        self.modify(fd, fd as u64, libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLONESHOT)
    }

    /// Wait for a batch of ready descriptors. EINTR is reported as an empty
    /// batch; any other failure is fatal to the caller's loop.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> EtudeResult<usize> {
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

// ---- Non-blocking I/O ----

/// Non-blocking recv. `Ok(None)` means WouldBlock (socket drained),
/// `Ok(Some(0))` means the peer closed the connection.
pub fn recv_nonblocking(fd: c_int, buf: &mut [u8]) -> EtudeResult<Option<usize>> {
    unsafe {
        let res = libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Vectored write: multiple buffers in a single syscall. `Ok(None)` means
/// WouldBlock.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> EtudeResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);
    for (i, buf) in bufs.iter().take(iov_count).enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

// ---- Memory-mapped files ----

/// Owned read-only memory mapping of a file. The mapping outlives the file
/// descriptor it was created from and is released on drop, which covers
/// every exit path of a file response.
pub struct Mmap {
    ptr: *mut c_void,
    len: usize,
}

impl Mmap {
    /// Map `len` bytes of `fd` read-only. `len` must be non-zero.
    pub fn map_readonly(fd: c_int, len: usize) -> EtudeResult<Self> {
        unsafe {
            let ptr = libc::mmap(ptr::null_mut(), len, libc::PROT_READ, libc::MAP_PRIVATE, fd, 0);
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { ptr, len })
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live PROT_READ mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

// SAFETY: the mapping is private, read-only and exclusively owned; moving it
// between threads or reading it from several is sound.
unsafe impl Send for Mmap {}
// SAFETY: see above; no interior mutation is possible through &Mmap.
unsafe impl Sync for Mmap {}
