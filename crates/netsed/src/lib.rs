//! Transparent TCP/UDP proxy that rewrites traffic in flight.
//!
//! This crate implements a stream/datagram interception engine: it listens on
//! a local port, forwards every connection (or datagram pseudo-connection) to
//! an upstream server, and applies an ordered list of byte-substitution rules
//! to each payload as it passes through. It is intended for protocol
//! debugging, fault injection, and on-the-wire patching of legacy wire
//! formats.
//!
//! # Rules
//!
//! Rules use a sed-like syntax, `s/pat/repl[/count]`, where arbitrary bytes
//! (including `0x00` and `/`) can be written as HTTP-style `%HH` hex escapes
//! and `%%` escapes a literal `%`. Rules are applied left to right within one
//! received payload, first match wins, and replaced bytes are never rescanned.
//! An optional trailing count expires the rule after that many substitutions
//! on a given flow.
//!
//! # Example
//!
//! ```ignore
//! use netsed::{Proxy, ProxyConfig, Transport};
//! use netsed::rules::{Rule, RuleSet};
//!
//! #[tokio::main]
//! async fn main() -> netsed::Result<()> {
//!     let rules = RuleSet::new(vec![Rule::parse("s/andrew/mike")?]);
//!
//!     let mut config = ProxyConfig::new(Transport::Tcp, 10101, rules);
//!     config.fixed_host = Some("192.0.2.7".parse().unwrap());
//!     config.fixed_port = Some(80);
//!
//!     let proxy = Proxy::bind(config)?;
//!     proxy.run().await
//! }
//! ```
//!
//! # Transparent interception
//!
//! When the upstream host or port is left dynamic, the proxy recovers the
//! address the client originally dialed from the redirected socket (netfilter
//! `SO_ORIGINAL_DST`, falling back to the socket's local address) and forwards
//! there. See [`resolve`] for the capability seam.

pub mod error;
pub mod flow;
pub mod listen;
pub mod proxy;
pub mod resolve;
pub mod rules;
pub mod sed;

pub use error::{Error, Result};
pub use proxy::{Proxy, ProxyConfig, Transport, UDP_TIMEOUT};
pub use rules::{Rule, RuleSet};
pub use sed::MAX_BUF;
