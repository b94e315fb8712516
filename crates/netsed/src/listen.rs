//! Listening socket setup.
//!
//! When the listen family is unspecified the proxy prefers a single
//! dual-stack IPv6 socket (`IPV6_V6ONLY` cleared) and falls back to plain
//! IPv4; when prior resolution fixed the family, the listener is restricted
//! to it. The sockets are created non-blocking so they can be handed to the
//! tokio reactor as-is.

use std::io;
use std::mem;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::{Error, Result};

/// Address family for the listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl From<IpAddr> for Family {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Bound, listening TCP socket on the wildcard address.
pub fn tcp_listener(family: Option<Family>, port: u16) -> Result<std::net::TcpListener> {
    let fd = bind_wildcard(family, libc::SOCK_STREAM, port).map_err(Error::Listener)?;
    // SAFETY: plain listen(2) on a descriptor we own.
    let rc = unsafe { libc::listen(fd.as_raw_fd(), 16) };
    if rc != 0 {
        return Err(Error::Listener(io::Error::last_os_error()));
    }
    Ok(std::net::TcpListener::from(fd))
}

/// Bound UDP socket on the wildcard address.
pub fn udp_socket(family: Option<Family>, port: u16) -> Result<std::net::UdpSocket> {
    let fd = bind_wildcard(family, libc::SOCK_DGRAM, port).map_err(Error::Listener)?;
    Ok(std::net::UdpSocket::from(fd))
}

fn bind_wildcard(family: Option<Family>, sock_type: libc::c_int, port: u16) -> io::Result<OwnedFd> {
    match family {
        Some(Family::V4) => bind_any(libc::AF_INET, sock_type, port, true),
        Some(Family::V6) => bind_any(libc::AF_INET6, sock_type, port, true),
        // Unspecified family: one dual-stack socket if the OS permits it.
        None => bind_any(libc::AF_INET6, sock_type, port, false)
            .or_else(|_| bind_any(libc::AF_INET, sock_type, port, false)),
    }
}

fn bind_any(
    af: libc::c_int,
    sock_type: libc::c_int,
    port: u16,
    v6only: bool,
) -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the descriptor is wrapped immediately.
    let raw = unsafe { libc::socket(af, sock_type | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw is a fresh descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    set_int_opt(&fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    if af == libc::AF_INET6 {
        // Best effort: some systems pin IPV6_V6ONLY and refuse the update.
        if let Err(e) = set_int_opt(&fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, v6only as libc::c_int)
        {
            tracing::warn!(error = %e, "failed to adjust IPV6_V6ONLY");
        }
    }

    if af == libc::AF_INET {
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: 0 },
            sin_zero: [0; 8],
        };
        // SAFETY: addr is a fully initialized sockaddr_in and the length
        // matches its size.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&raw const addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    } else {
        let addr = libc::sockaddr_in6 {
            sin6_family: libc::AF_INET6 as libc::sa_family_t,
            sin6_port: port.to_be(),
            sin6_flowinfo: 0,
            sin6_addr: libc::in6_addr { s6_addr: [0; 16] },
            sin6_scope_id: 0,
        };
        // SAFETY: addr is a fully initialized sockaddr_in6 and the length
        // matches its size.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&raw const addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(fd)
}

fn set_int_opt(
    fd: &OwnedFd,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: value is a c_int and the option length says so.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            option,
            (&raw const value).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
