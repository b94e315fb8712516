//! End-to-end forwarding tests: a real listener, a real upstream, and
//! rewritten bytes on the wire in both directions.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use netsed::proxy::{Proxy, ProxyConfig, Transport};
use netsed::rules::{Rule, RuleSet};

const WAIT: Duration = Duration::from_secs(5);

fn rules(texts: &[&str]) -> RuleSet {
    RuleSet::new(texts.iter().map(|t| Rule::parse(t).unwrap()).collect())
}

/// Bind a proxy with fixed forwarding to `upstream` and run it in the
/// background; returns the port to dial.
fn spawn_proxy(transport: Transport, set: RuleSet, upstream: SocketAddr) -> u16 {
    spawn_proxy_with_timeout(transport, set, upstream, Duration::from_secs(30))
}

fn spawn_proxy_with_timeout(
    transport: Transport,
    set: RuleSet,
    upstream: SocketAddr,
    idle: Duration,
) -> u16 {
    let mut config = ProxyConfig::new(transport, 0, set);
    config.fixed_host = Some(upstream.ip());
    config.fixed_port = Some(upstream.port());
    config.datagram_timeout = idle;
    let proxy = Proxy::bind(config).unwrap();
    let port = proxy.local_addr().unwrap().port();
    tokio::spawn(proxy.run());
    port
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

#[tokio::test]
async fn test_tcp_rewrites_both_directions() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = spawn_proxy(
        Transport::Tcp,
        rules(&["s/andrew/mike"]),
        upstream.local_addr().unwrap(),
    );

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut server, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();

    client.write_all(b"hello andrew and andrew").await.unwrap();
    assert_eq!(read_exact(&mut server, 19).await, b"hello mike and mike");

    server.write_all(b"bye andrew").await.unwrap();
    assert_eq!(read_exact(&mut client, 8).await, b"bye mike");
}

#[tokio::test]
async fn test_tcp_pass_through_when_nothing_matches() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = spawn_proxy(
        Transport::Tcp,
        rules(&["s/zzz/qqq"]),
        upstream.local_addr().unwrap(),
    );

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut server, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();

    client.write_all(b"untouched payload").await.unwrap();
    assert_eq!(read_exact(&mut server, 17).await, b"untouched payload");
}

#[tokio::test]
async fn test_tcp_limited_rule_expires_across_events() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = spawn_proxy(
        Transport::Tcp,
        rules(&["s/x/Y/1"]),
        upstream.local_addr().unwrap(),
    );

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut server, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();

    client.write_all(b"axa").await.unwrap();
    assert_eq!(read_exact(&mut server, 3).await, b"aYa");

    // Reading the first event above guarantees the proxy forwarded it, so
    // this write is a distinct receive event on an expired rule.
    client.write_all(b"axa").await.unwrap();
    assert_eq!(read_exact(&mut server, 3).await, b"axa");
}

#[tokio::test]
async fn test_tcp_no_match_across_event_boundary() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = spawn_proxy(
        Transport::Tcp,
        rules(&["s/hello/HI"]),
        upstream.local_addr().unwrap(),
    );

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut server, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();

    client.write_all(b"hel").await.unwrap();
    assert_eq!(read_exact(&mut server, 3).await, b"hel");
    client.write_all(b"lo").await.unwrap();
    assert_eq!(read_exact(&mut server, 2).await, b"lo");
}

#[tokio::test]
async fn test_tcp_fresh_connection_gets_fresh_budgets() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = spawn_proxy(
        Transport::Tcp,
        rules(&["s/x/Y/1"]),
        upstream.local_addr().unwrap(),
    );

    for _ in 0..2 {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (mut server, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();
        client.write_all(b"x").await.unwrap();
        // Each connection is a new flow with its own TTL clone.
        assert_eq!(read_exact(&mut server, 1).await, b"Y");
    }
}

#[tokio::test]
async fn test_tcp_client_close_reaches_server() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = spawn_proxy(
        Transport::Tcp,
        rules(&["s/a/b"]),
        upstream.local_addr().unwrap(),
    );

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut server, _) = timeout(WAIT, upstream.accept()).await.unwrap().unwrap();

    client.write_all(b"a").await.unwrap();
    assert_eq!(read_exact(&mut server, 1).await, b"b");

    // Closing the client disconnects the flow; the upstream side sees EOF.
    drop(client);
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, server.read(&mut buf))
        .await
        .expect("eof timed out")
        .unwrap();
    assert_eq!(n, 0);
}

async fn recv_from(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (n, from) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("recv timed out")
        .unwrap();
    (buf[..n].to_vec(), from)
}

#[tokio::test]
async fn test_udp_rewrites_both_directions() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = spawn_proxy(
        Transport::Udp,
        rules(&["s/cat/dog"]),
        upstream.local_addr().unwrap(),
    );

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"cat one", ("127.0.0.1", port)).await.unwrap();
    let (payload, flow_addr) = recv_from(&upstream).await;
    assert_eq!(payload, b"dog one");

    upstream.send_to(b"cat two", flow_addr).await.unwrap();
    let (reply, _) = recv_from(&client).await;
    assert_eq!(reply, b"dog two");
}

#[tokio::test]
async fn test_udp_pseudo_connection_shares_budgets() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = spawn_proxy(
        Transport::Udp,
        rules(&["s/ping/pong/1"]),
        upstream.local_addr().unwrap(),
    );

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", ("127.0.0.1", port)).await.unwrap();
    let (first, flow_addr) = recv_from(&upstream).await;
    assert_eq!(first, b"pong");

    // The budget is per pseudo-connection and already spent, so the reply
    // passes through untouched...
    upstream.send_to(b"ping", flow_addr).await.unwrap();
    let (reply, _) = recv_from(&client).await;
    assert_eq!(reply, b"ping");

    // ...and so does a second datagram routed through the same flow.
    client.send_to(b"ping", ("127.0.0.1", port)).await.unwrap();
    let (second, again) = recv_from(&upstream).await;
    assert_eq!(second, b"ping");
    assert_eq!(again, flow_addr);
}

#[tokio::test]
async fn test_udp_idle_flow_reaped_and_readmitted() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = spawn_proxy_with_timeout(
        Transport::Udp,
        rules(&["s/a/b/1"]),
        upstream.local_addr().unwrap(),
        Duration::from_millis(150),
    );

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"a", ("127.0.0.1", port)).await.unwrap();
    let (first, _) = recv_from(&upstream).await;
    assert_eq!(first, b"b");

    // Let the pseudo-connection idle out, then send again from the same
    // peer: a fresh flow is admitted with a fresh budget.
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.send_to(b"a", ("127.0.0.1", port)).await.unwrap();
    let (second, _) = recv_from(&upstream).await;
    assert_eq!(second, b"b");
}

#[tokio::test]
async fn test_udp_distinct_peers_get_distinct_flows() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = spawn_proxy(
        Transport::Udp,
        rules(&["s/a/b/1"]),
        upstream.local_addr().unwrap(),
    );

    let one = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let two = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    one.send_to(b"a", ("127.0.0.1", port)).await.unwrap();
    let (first, from_one) = recv_from(&upstream).await;
    assert_eq!(first, b"b");

    // A different source port keys a separate flow with its own budget.
    two.send_to(b"a", ("127.0.0.1", port)).await.unwrap();
    let (second, from_two) = recv_from(&upstream).await;
    assert_eq!(second, b"b");
    assert_ne!(from_one, from_two);
}
