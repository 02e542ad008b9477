//! Protocol upgrades tunnelled through the proxy.

mod common;

use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::*;
use edge_proxy::config::{LbPolicy, VirtualHostConfig};
use edge_proxy::EdgeServerSet;

async fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = socket.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed inside the response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn echo(socket: &mut TcpStream, message: &[u8]) {
    socket.write_all(message).await.unwrap();
    let mut reply = vec![0u8; message.len()];
    tokio::time::timeout(Duration::from_secs(2), socket.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, message);
}

async fn assert_tunnelled(vhost: VirtualHostConfig) {
    let host = vhost.hostname.clone();
    let servers = EdgeServerSet::start(&config(vec![listener(vec![vhost])]))
        .await
        .unwrap();
    let proxy = servers.local_addrs()[0];
    let tracker = servers.listeners()[0].tracker().clone();

    let mut socket = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET /chat HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        host
    );
    socket.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut socket).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {}", head);
    assert!(head.to_ascii_lowercase().contains("upgrade: echo"), "{}", head);
    echo(&mut socket, b"ping").await;

    // Switched connections leave the tracker but keep working.
    for _ in 0..100 {
        if tracker.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(tracker.is_empty());
    echo(&mut socket, b"still here").await;

    let started = Instant::now();
    servers.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn upgrade_through_single_upstream() {
    let backend = start_upgrade_backend().await;
    assert_tunnelled(proxy_host("ws.test", &format!("http://{}", backend))).await;
}

#[tokio::test]
async fn upgrade_through_balanced_host() {
    let backend = start_upgrade_backend().await;
    assert_tunnelled(balanced_host(
        "ws.test",
        vec![format!("http://{}", backend)],
        LbPolicy::RoundRobin,
    ))
    .await;
}

#[tokio::test]
async fn plain_requests_do_not_carry_upgrade_headers() {
    let backend = start_backend("plain").await;
    let servers = EdgeServerSet::start(&config(vec![listener(vec![proxy_host(
        "plain.test",
        &backend.url(),
    )])]))
    .await
    .unwrap();
    let proxy = servers.local_addrs()[0];

    let response = client()
        .get(format!("http://{}/", proxy))
        .header("host", "plain.test")
        .header("upgrade", "h2c")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let seen = backend.requests();
    assert_eq!(seen[0].header("upgrade"), None);
    servers.stop().await;
}
