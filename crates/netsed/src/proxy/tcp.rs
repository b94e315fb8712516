//! Stream dispatcher: accept, resolve the upstream, forward both directions.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{Shared, log_forward, printable};
use crate::error::{Error, Result};
use crate::flow::Flow;
use crate::sed::MAX_BUF;

pub(crate) async fn run(listener: TcpListener, shared: Arc<Shared>) -> Result<()> {
    loop {
        let (downstream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                // Transient accept failures don't take the listener down.
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        admit(&shared, downstream, peer);
    }
}

fn admit(shared: &Arc<Shared>, downstream: TcpStream, peer: SocketAddr) {
    let resolved = match shared.resolver.resolve(&downstream) {
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

    let shared = shared.clone();
    tokio::spawn(async move {
        let upstream = match TcpStream::connect(upstream_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                println!("[!] Cannot connect to remote server, dropping connection.");
                let e = Error::UpstreamUnreachable {
                    addr: upstream_addr,
                    source: e,
                };
                tracing::warn!(%peer, error = %e, "flow admission failed");
                return;
            }
        };
        forward(shared, downstream, upstream).await;
        tracing::debug!(%peer, "flow reaped");
    });
}

enum Event {
    ClientToServer(io::Result<usize>),
    ServerToClient(io::Result<usize>),
}

/// Forward one established connection until either side closes or errors.
async fn forward(shared: Arc<Shared>, mut downstream: TcpStream, mut upstream: TcpStream) {
    let mut flow = Flow::stream(&shared.rules);
    // Receive scratch, sized to one event and allocated once per flow.
    let mut client_buf = vec![0u8; MAX_BUF];
    let mut server_buf = vec![0u8; MAX_BUF];

    while !flow.state().is_terminal() {
        let event = tokio::select! {
            r = downstream.read(&mut client_buf) => Event::ClientToServer(r),
            r = upstream.read(&mut server_buf) => Event::ServerToClient(r),
        };
        match event {
            Event::ClientToServer(Ok(0)) => {
                tracing::debug!("client disconnected (rd)");
                flow.disconnect();
            }
            Event::ClientToServer(Ok(n)) => {
                println!("[+] Caught client -> server packet.");
                match flow.rewrite(&shared.rules, &client_buf[..n]) {
                    Ok(rewrite) => {
                        log_forward(&rewrite, n);
                        tracing::debug!(payload = %printable(&rewrite.data), "client -> server");
                        if let Err(e) = upstream.write_all(&rewrite.data).await {
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
            Event::ServerToClient(Ok(0)) => {
                tracing::debug!("server disconnected (rd)");
                flow.disconnect();
            }
            Event::ServerToClient(Ok(n)) => {
                println!("[+] Caught server -> client packet.");
                match flow.rewrite(&shared.rules, &server_buf[..n]) {
                    Ok(rewrite) => {
                        log_forward(&rewrite, n);
                        tracing::debug!(payload = %printable(&rewrite.data), "server -> client");
                        flow.mark_established();
                        if let Err(e) = downstream.write_all(&rewrite.data).await {
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
            Event::ClientToServer(Err(e)) | Event::ServerToClient(Err(e))
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                // Transient; no state change, no byte movement.
            }
            Event::ClientToServer(Err(e)) => {
                tracing::debug!(error = %e, "client disconnected (rd err)");
                flow.disconnect();
            }
            Event::ServerToClient(Err(e)) => {
                tracing::debug!(error = %e, "server disconnected (rd err)");
                flow.disconnect();
            }
        }
    }
}
