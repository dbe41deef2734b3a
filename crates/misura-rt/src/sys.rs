//! Syscall layer for datagram sockets.
//!
//! The reactor performs datagram I/O through the [`NetSys`] capability so
//! tests can fake OS failures without touching a real socket. The default
//! [`OsNet`] implementation is a set of thin shims over `libc`.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};

/// Datagram socket address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn raw(self) -> libc::c_int {
        match self {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
        }
    }

    /// The family of a concrete address.
    pub fn of(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

/// Capability over the syscalls a datagram socket needs.
///
/// `connect(fd, None)` dissolves the association (`AF_UNSPEC` connect).
/// `recvfrom` returns `None` for the peer when the kernel does not report
/// one, which happens on some platforms for connected sockets.
pub trait NetSys: Send + Sync + 'static {
    fn socket(&self, family: Family) -> Result<OwnedFd>;
    fn bind(&self, fd: BorrowedFd<'_>, addr: &SocketAddr) -> Result<()>;
    fn connect(&self, fd: BorrowedFd<'_>, addr: Option<&SocketAddr>) -> Result<()>;
    fn sendto(&self, fd: BorrowedFd<'_>, buf: &[u8], dest: Option<&SocketAddr>) -> Result<usize>;
    fn recvfrom(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)>;
    fn local_addr(&self, fd: BorrowedFd<'_>) -> Result<SocketAddr>;
}

/// The real thing.
pub struct OsNet;

impl NetSys for OsNet {
    fn socket(&self, family: Family) -> Result<OwnedFd> {
        let fd = unsafe { libc::socket(family.raw(), libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(Error::last_os());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        set_nonblocking(owned.as_raw_fd())?;
        Ok(owned)
    }

    fn bind(&self, fd: BorrowedFd<'_>, addr: &SocketAddr) -> Result<()> {
        let (raw_addr, addr_len) = socket_addr_to_raw(addr);
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &raw_addr as *const _ as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    fn connect(&self, fd: BorrowedFd<'_>, addr: Option<&SocketAddr>) -> Result<()> {
        let (raw_addr, addr_len) = match addr {
            Some(addr) => socket_addr_to_raw(addr),
            // Connecting to AF_UNSPEC dissolves the association.
            None => {
                let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
                storage.ss_family = libc::AF_UNSPEC as libc::sa_family_t;
                (
                    storage,
                    std::mem::size_of::<libc::sockaddr>() as libc::socklen_t,
                )
            }
        };
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &raw_addr as *const _ as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Disconnecting may report EAFNOSUPPORT even on success.
            if addr.is_none() && err.raw_os_error() == Some(libc::EAFNOSUPPORT) {
                return Ok(());
            }
            return Err(Error::from_io(err));
        }
        Ok(())
    }

    fn sendto(&self, fd: BorrowedFd<'_>, buf: &[u8], dest: Option<&SocketAddr>) -> Result<usize> {
        let n = match dest {
            Some(dest) => {
                let (raw_addr, addr_len) = socket_addr_to_raw(dest);
                unsafe {
                    libc::sendto(
                        fd.as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        0,
                        &raw_addr as *const _ as *const libc::sockaddr,
                        addr_len,
                    )
                }
            }
            None => unsafe {
                libc::send(
                    fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    0,
                )
            },
        };
        if n < 0 {
            return Err(Error::last_os());
        }
        Ok(n as usize)
    }

    fn recvfrom(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addr_len: libc::socklen_t =
            std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if n < 0 {
            return Err(Error::last_os());
        }
        Ok((n as usize, raw_to_socket_addr(&storage).ok()))
    }

    fn local_addr(&self, fd: BorrowedFd<'_>) -> Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addr_len: libc::socklen_t =
            std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                fd.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if rc < 0 {
            return Err(Error::last_os());
        }
        raw_to_socket_addr(&storage)
    }
}

// ── Address conversion ──────────────────────────────────────────────

/// Convert a `SocketAddr` to a raw `(sockaddr_storage, socklen_t)` pair.
pub(crate) fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    match addr {
        SocketAddr::V4(v4) => {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                sin.sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
            }
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                sin6.sin6_len = std::mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// Convert a raw `sockaddr_storage` back to a `SocketAddr`.
pub(crate) fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let octets = sin.sin_addr.s_addr.to_ne_bytes();
            let ip = std::net::Ipv4Addr::from(octets);
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::V4(std::net::SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::V6(std::net::SocketAddrV6::new(
                ip,
                port,
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::Value),
    }
}

/// Set a file descriptor to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}
