//! The dispatcher: listener admission and per-flow forwarding.
//!
//! One listener task admits new flows; every live flow runs in its own
//! cooperative task that forwards at most one receive event per direction at
//! a time through the substitution engine. Per-flow work is serialized
//! inside its task, so bytes within one direction of one flow are forwarded
//! in strict receive order and an error on one flow never disturbs the
//! listener or any other flow.

mod tcp;
mod udp;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};

use crate::error::{Error, Result};
use crate::listen::{self, Family};
use crate::resolve::Resolver;
use crate::rules::RuleSet;
use crate::sed::Rewrite;

/// Idle lifetime of a datagram pseudo-connection.
pub const UDP_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(format!("unknown protocol '{other}' (expected tcp or udp)")),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        })
    }
}

/// Everything the dispatcher needs: transport, listening port, destination
/// overrides, and the frozen rule list.
#[derive(Debug)]
pub struct ProxyConfig {
    pub transport: Transport,
    /// Local port to listen on; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Fixed upstream host; `None` uses the original destination host.
    pub fixed_host: Option<IpAddr>,
    /// Fixed upstream port; `None` uses the original destination port.
    pub fixed_port: Option<u16>,
    pub rules: RuleSet,
    /// Idle lifetime of datagram pseudo-connections.
    pub datagram_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(transport: Transport, listen_port: u16, rules: RuleSet) -> Self {
        ProxyConfig {
            transport,
            listen_port,
            fixed_host: None,
            fixed_port: None,
            rules,
            datagram_timeout: UDP_TIMEOUT,
        }
    }
}

/// State shared by the listener task and every flow task.
pub(crate) struct Shared {
    pub(crate) rules: RuleSet,
    pub(crate) resolver: Resolver,
    pub(crate) datagram_timeout: Duration,
}

enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

/// A bound proxy, ready to dispatch.
pub struct Proxy {
    listener: Listener,
    shared: Arc<Shared>,
}

impl Proxy {
    /// Bind the listening endpoint. Must be called within a tokio runtime.
    ///
    /// The listen family follows the fixed upstream host when one is given;
    /// otherwise the listener accepts both families where the OS permits.
    pub fn bind(config: ProxyConfig) -> Result<Self> {
        let family = config.fixed_host.map(Family::from);
        let shared = Arc::new(Shared {
            resolver: Resolver::new(config.fixed_host, config.fixed_port),
            rules: config.rules,
            datagram_timeout: config.datagram_timeout,
        });
        let listener = match config.transport {
            Transport::Tcp => {
                let std_listener = listen::tcp_listener(family, config.listen_port)?;
                Listener::Tcp(TcpListener::from_std(std_listener).map_err(Error::Listener)?)
            }
            Transport::Udp => {
                let std_socket = listen::udp_socket(family, config.listen_port)?;
                Listener::Udp(Arc::new(
                    UdpSocket::from_std(std_socket).map_err(Error::Listener)?,
                ))
            }
        };
        Ok(Proxy { listener, shared })
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr(),
            Listener::Udp(socket) => socket.local_addr(),
        }
        .map_err(Error::Io)
    }

    /// Run the dispatcher until the process is interrupted.
    pub async fn run(self) -> Result<()> {
        match self.listener {
            Listener::Tcp(listener) => tcp::run(listener, self.shared).await,
            Listener::Udp(socket) => udp::run(socket, self.shared).await,
        }
    }
}

/// Per-event summary line.
pub(crate) fn log_forward(rewrite: &Rewrite, orig: usize) {
    if rewrite.replacements == 0 {
        println!("[*] Forwarding untouched packet of size {orig}.");
    } else {
        println!(
            "[*] Done {} replacements, forwarding packet of size {} (orig {}).",
            rewrite.replacements,
            rewrite.data.len(),
            orig
        );
    }
}

/// Payload rendered with non-printable bytes blanked, for debug traces.
pub(crate) fn printable(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                ' '
            }
        })
        .collect()
}
