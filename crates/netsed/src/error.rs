//! Error types for rule parsing, proxy setup, and per-flow forwarding.

use std::io;
use std::net::SocketAddr;

/// Errors produced by the proxy.
///
/// Startup errors (rule syntax, resolution, listener setup) abort the
/// process. Per-flow errors are absorbed at the dispatcher boundary: they
/// terminate the flow that raised them and never affect the listener or
/// other flows.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unparseable substitution rule.
    #[error("bad rule '{rule}': {reason}")]
    RuleSyntax {
        /// The rule text as given on the command line.
        rule: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Name or service lookup failure for a listen or upstream endpoint.
    #[error("cannot resolve '{endpoint}': {source}")]
    Resolution {
        /// The endpoint string that failed to resolve.
        endpoint: String,
        /// The underlying lookup error.
        source: io::Error,
    },

    /// Listening socket setup failure.
    #[error("listener setup failed: {0}")]
    Listener(#[source] io::Error),

    /// Upstream socket creation or connect failure for one flow.
    ///
    /// Reported, not fatal: the flow is dropped and the dispatcher continues.
    #[error("cannot connect to upstream {addr}: {source}")]
    UpstreamUnreachable {
        /// The upstream address the flow was aimed at.
        addr: SocketAddr,
        /// The underlying connect error.
        source: io::Error,
    },

    /// The original destination is unavailable and no static override covers
    /// the missing component.
    #[error("no upstream address: original destination unavailable and no fixed host/port")]
    NoUpstream,

    /// Substitution output exceeded the rewrite cap; terminates the flow.
    #[error("rewriting {input} input bytes exceeded the {max} byte output cap")]
    RewriteOverflow {
        /// Size of the input event.
        input: usize,
        /// The fixed output cap.
        max: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
