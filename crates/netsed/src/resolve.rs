//! Transparent destination resolution for newly admitted flows.
//!
//! A redirected client never dialed the proxy on purpose; the address it
//! intended to reach has to be recovered from the downstream socket. That
//! recovery is an OS capability behind the [`OriginalDst`] trait, with two
//! implementations: netfilter's `SO_ORIGINAL_DST` (REDIRECT/DNAT targets)
//! and a plain local-address fallback for setups where the redirect target
//! is delivered directly. The [`Resolver`] overlays any fixed host or port
//! from the command line on top of the recovered address.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};

use crate::error::{Error, Result};

/// OS capability that recovers the address a redirected client originally
/// dialed.
pub trait OriginalDst: Send + Sync {
    fn original_dst(&self, fd: RawFd) -> io::Result<SocketAddr>;
}

/// `SO_ORIGINAL_DST` / `IP6T_SO_ORIGINAL_DST` from the netfilter headers.
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Recovery through netfilter connection tracking, for sockets redirected
/// with iptables/nftables REDIRECT or DNAT.
#[derive(Debug, Clone, Copy)]
pub struct NetfilterDst;

impl OriginalDst for NetfilterDst {
    fn original_dst(&self, fd: RawFd) -> io::Result<SocketAddr> {
        getsockopt_addr(fd, libc::SOL_IP, SO_ORIGINAL_DST)
            .or_else(|_| getsockopt_addr(fd, libc::SOL_IPV6, SO_ORIGINAL_DST))
    }
}

/// Fallback that reports the local address of the redirected socket, for
/// systems where the redirect delivers the original destination directly.
#[derive(Debug, Clone, Copy)]
pub struct LocalAddrDst;

impl OriginalDst for LocalAddrDst {
    fn original_dst(&self, fd: RawFd) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // SAFETY: storage is a properly aligned sockaddr_storage and len
        // carries its size; the kernel writes at most len bytes.
        let rc = unsafe {
            libc::getsockname(fd, (&raw mut storage).cast::<libc::sockaddr>(), &raw mut len)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to_addr(&storage, len as usize)
    }
}

/// Default capability: netfilter recovery with the local-address fallback.
#[derive(Debug, Clone, Copy)]
struct SystemDst;

impl OriginalDst for SystemDst {
    fn original_dst(&self, fd: RawFd) -> io::Result<SocketAddr> {
        NetfilterDst
            .original_dst(fd)
            .or_else(|_| LocalAddrDst.original_dst(fd))
    }
}

fn getsockopt_addr(fd: RawFd, level: libc::c_int, option: libc::c_int) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage is a properly aligned sockaddr_storage and len carries
    // its size; the kernel writes at most len bytes.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            option,
            (&raw mut storage).cast::<libc::c_void>(),
            &raw mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_addr(&storage, len as usize)
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: ss_family says this storage holds a sockaddr_in and
            // len confirms it is large enough.
            let sin = unsafe { &*(&raw const *storage).cast::<libc::sockaddr_in>() };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: ss_family says this storage holds a sockaddr_in6 and
            // len confirms it is large enough.
            let sin6 = unsafe { &*(&raw const *storage).cast::<libc::sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

/// Outcome of destination resolution for one flow.
#[derive(Debug, Clone, Copy)]
pub struct Resolved {
    /// Original destination exactly as the OS reported it, before any
    /// override; absent when the capability had nothing to say.
    pub original: Option<SocketAddr>,
    /// Upstream address after override overlay.
    pub upstream: SocketAddr,
}

/// Selects the upstream peer for a new flow.
///
/// The original destination of the redirected client is overlaid with any
/// fixed host or port given on the command line. The capability is queried
/// on every admission so the trace can show the address the client dialed;
/// its failure aborts admission with [`Error::NoUpstream`] only when a
/// component has no override.
pub struct Resolver {
    fixed_host: Option<IpAddr>,
    fixed_port: Option<u16>,
    capability: Box<dyn OriginalDst>,
}

impl Resolver {
    pub fn new(fixed_host: Option<IpAddr>, fixed_port: Option<u16>) -> Self {
        Resolver::with_capability(fixed_host, fixed_port, Box::new(SystemDst))
    }

    pub fn with_capability(
        fixed_host: Option<IpAddr>,
        fixed_port: Option<u16>,
        capability: Box<dyn OriginalDst>,
    ) -> Self {
        Resolver {
            fixed_host,
            fixed_port,
            capability,
        }
    }

    /// Upstream address for a flow admitted on `sock`, together with the raw
    /// original destination for the admission trace.
    pub fn resolve(&self, sock: &impl AsRawFd) -> Result<Resolved> {
        let original = self.capability.original_dst(sock.as_raw_fd()).ok();
        let upstream = match (self.fixed_host, self.fixed_port) {
            (Some(host), Some(port)) => SocketAddr::new(host, port),
            _ => {
                let original = original.ok_or(Error::NoUpstream)?;
                SocketAddr::new(
                    self.fixed_host.unwrap_or_else(|| original.ip()),
                    self.fixed_port.unwrap_or_else(|| original.port()),
                )
            }
        };
        Ok(Resolved { original, upstream })
    }
}
