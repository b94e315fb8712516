//! Datagram dispatcher: pseudo-connections keyed by the peer address.
//!
//! UDP has no accept; the listener receives every datagram and routes it by
//! the exact sender address. The first datagram from an unknown peer admits
//! a pseudo-connection with its own connected upstream socket and rule
//! budgets; replies come back through the shared listening socket. A
//! pseudo-connection that stays idle past the timeout is reaped, and a later
//! datagram from the same peer starts a fresh one.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};

use super::{Shared, log_forward, printable};
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowTable};
use crate::sed::MAX_BUF;

type Table = Arc<Mutex<FlowTable<Sender<Bytes>>>>;

pub(crate) async fn run(socket: Arc<UdpSocket>, shared: Arc<Shared>) -> Result<()> {
    let table: Table = Arc::new(Mutex::new(FlowTable::new()));
    let mut buf = vec![0u8; MAX_BUF];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "recvfrom failed");
                continue;
            }
        };
        let payload = Bytes::copy_from_slice(&buf[..len]);

        let handle = table.lock().unwrap().find(&peer).cloned();
        match handle {
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // The flow can't keep up; UDP may drop.
                    tracing::debug!(%peer, "flow backlogged, dropping datagram");
                }
                Err(TrySendError::Closed(payload)) => {
                    // The flow task ended but hasn't deregistered yet; this
                    // datagram starts a fresh pseudo-connection.
                    table.lock().unwrap().remove(&peer);
                    admit(&shared, &socket, &table, peer, payload);
                }
            },
            None => admit(&shared, &socket, &table, peer, payload),
        }
    }
}

/// Register a new pseudo-connection and hand it its first datagram.
fn admit(shared: &Arc<Shared>, socket: &Arc<UdpSocket>, table: &Table, peer: SocketAddr, first: Bytes) {
    let resolved = match shared.resolver.resolve(socket.as_ref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            println!("[+] Got incoming connection from {peer}");
            println!("[!] Cannot connect to remote server, dropping connection.");
            tracing::warn!(%peer, error = %e, "flow admission failed");
            return;
        }
    };
    match resolved.original {
        Some(original) => println!("[+] Got incoming connection from {peer} to {original}"),
        None => println!("[+] Got incoming connection from {peer}"),
    }
    let upstream_addr = resolved.upstream;
    println!("[*] Forwarding connection to {upstream_addr}");

    // Register before the upstream connect completes so a quick second
    // datagram from the same peer queues into this flow instead of keying a
    // duplicate one.
    let (tx, rx) = mpsc::channel(64);
    table.lock().unwrap().insert(peer, tx);
    tokio::spawn(flow_task(
        shared.clone(),
        socket.clone(),
        table.clone(),
        peer,
        upstream_addr,
        first,
        rx,
    ));
}

enum Event {
    Client(Option<Bytes>),
    Server(std::io::Result<usize>),
    Idle,
}

async fn flow_task(
    shared: Arc<Shared>,
    listener: Arc<UdpSocket>,
    table: Table,
    peer: SocketAddr,
    upstream_addr: SocketAddr,
    first: Bytes,
    mut rx: Receiver<Bytes>,
) {
    let upstream = match connect_upstream(upstream_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            // The already-received datagram is dropped with the flow.
            println!("[!] Cannot connect to remote server, dropping connection.");
            tracing::warn!(%peer, error = %e, "flow admission failed");
            table.lock().unwrap().remove(&peer);
            return;
        }
    };

    let mut flow = Flow::datagram(&shared.rules);
    let mut buf = vec![0u8; MAX_BUF];
    let mut pending = Some(first);

    while !flow.state().is_terminal() {
        if let Some(payload) = pending.take() {
            client_to_server(&shared, &mut flow, &upstream, &payload).await;
            continue;
        }
        let deadline =
            tokio::time::Instant::from_std(flow.idle_deadline(shared.datagram_timeout));
        let event = tokio::select! {
            d = rx.recv() => Event::Client(d),
            r = upstream.recv(&mut buf) => Event::Server(r),
            _ = tokio::time::sleep_until(deadline) => Event::Idle,
        };
        match event {
            Event::Client(Some(payload)) => {
                client_to_server(&shared, &mut flow, &upstream, &payload).await;
            }
            Event::Client(None) => {
                // Dispatcher gone; the proxy is shutting down.
                flow.disconnect();
            }
            Event::Server(Ok(0)) => {
                tracing::debug!("server disconnected (rd)");
                flow.disconnect();
            }
            Event::Server(Ok(n)) => {
                server_to_client(&shared, &mut flow, &listener, peer, &buf[..n]).await;
            }
            Event::Server(Err(e)) => {
                tracing::debug!(error = %e, "server disconnected (rd err)");
                flow.disconnect();
            }
            Event::Idle => {
                tracing::debug!(%peer, "pseudo-connection timed out");
                flow.time_out();
            }
        }
    }

    table.lock().unwrap().remove(&peer);
    tracing::debug!(%peer, "flow reaped");
}

async fn client_to_server(shared: &Shared, flow: &mut Flow, upstream: &UdpSocket, payload: &[u8]) {
    println!("[+] Caught client -> server packet.");
    match flow.rewrite(&shared.rules, payload) {
        Ok(rewrite) => {
            log_forward(&rewrite, payload.len());
            tracing::debug!(payload = %printable(&rewrite.data), "client -> server");
            if let Err(e) = upstream.send(&rewrite.data).await {
                tracing::debug!(error = %e, "server disconnected (wr)");
                flow.disconnect();
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "dropping flow");
            flow.disconnect();
        }
    }
}

async fn server_to_client(
    shared: &Shared,
    flow: &mut Flow,
    listener: &UdpSocket,
    peer: SocketAddr,
    payload: &[u8],
) {
    println!("[+] Caught server -> client packet.");
    match flow.rewrite(&shared.rules, payload) {
        Ok(rewrite) => {
            log_forward(&rewrite, payload.len());
            tracing::debug!(payload = %printable(&rewrite.data), "server -> client");
            flow.mark_established();
            if let Err(e) = listener.send_to(&rewrite.data, peer).await {
                tracing::debug!(error = %e, "client disconnected (wr)");
                flow.disconnect();
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "dropping flow");
            flow.disconnect();
        }
    }
}

/// Connected upstream socket for one pseudo-connection, bound to the
/// matching wildcard family.
async fn connect_upstream(addr: SocketAddr) -> Result<UdpSocket> {
    let local = SocketAddr::new(
        match addr {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        },
        0,
    );
    let unreachable = |source| Error::UpstreamUnreachable { addr, source };
    let socket = UdpSocket::bind(local).await.map_err(unreachable)?;
    socket.connect(addr).await.map_err(unreachable)?;
    Ok(socket)
}
