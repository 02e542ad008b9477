//! Upstream and connection deadlines.

mod common;

use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use common::*;
use edge_proxy::config::LbPolicy;
use edge_proxy::EdgeServerSet;

/// Long enough that only a proxy-side deadline ends the request.
const NEVER: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn hung_backend_fails_over_to_a_live_one() {
    // Answers health checks but never a proxied request.
    let hung = start_slow_backend("hung", NEVER).await;
    let live = start_backend("live").await;
    let mut config = config(vec![listener(vec![balanced_host(
        "lb.test",
        vec![hung.url(), live.url()],
        LbPolicy::RoundRobin,
    )])]);
    config.upstream.response_header_timeout_secs = 1;
    let servers = EdgeServerSet::start(&config).await.unwrap();
    let proxy = servers.local_addrs()[0];
    let client = client();

    // Round robin starts at the hung backend.
    let started = Instant::now();
    let response = get(&client, proxy, "lb.test", "/").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "live");
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(hung.hits(), 1);

    // Marked dead, so later requests go straight to the live backend.
    let started = Instant::now();
    for _ in 0..4 {
        let response = get(&client, proxy, "lb.test", "/").await;
        assert_eq!(response.status(), 200);
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(hung.hits(), 1);
    assert_eq!(live.hits(), 5);
    servers.stop().await;
}

#[tokio::test]
async fn hung_single_upstream_yields_504() {
    let hung = start_slow_backend("hung", NEVER).await;
    let mut config = config(vec![listener(vec![proxy_host("hung.test", &hung.url())])]);
    config.upstream.response_header_timeout_secs = 1;
    let servers = EdgeServerSet::start(&config).await.unwrap();
    let proxy = servers.local_addrs()[0];

    let response = get(&client(), proxy, "hung.test", "/").await;
    assert_eq!(response.status(), 504);
    servers.stop().await;
}

#[tokio::test]
async fn evicted_idle_connections_finish_large_responses() {
    let size = 16 * 1024 * 1024;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("big.bin"), vec![b'x'; size]).unwrap();
    let mut config = config(vec![listener(vec![static_host("files.test", dir.path())])]);
    // Every connection that goes idle is retired right away.
    config.connections.max_idle = 0;
    let servers = EdgeServerSet::start(&config).await.unwrap();
    let proxy = servers.local_addrs()[0];
    let client = client();

    for _ in 0..5 {
        let response = get(&client, proxy, "files.test", "/big.bin").await;
        assert_eq!(response.status(), 200);
        let body = response.bytes().await.unwrap();
        assert_eq!(body.len(), size);
    }
    servers.stop().await;
}

#[tokio::test]
async fn client_that_stops_reading_is_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("big.bin"), vec![b'x'; 32 * 1024 * 1024]).unwrap();
    let mut config = config(vec![listener(vec![static_host("files.test", dir.path())])]);
    config.timeouts.write_secs = 1;
    let servers = EdgeServerSet::start(&config).await.unwrap();
    let proxy = servers.local_addrs()[0];
    let tracker = servers.listeners()[0].tracker().clone();

    let mut socket = TcpStream::connect(proxy).await.unwrap();
    socket
        .write_all(b"GET /big.bin HTTP/1.1\r\nHost: files.test\r\n\r\n")
        .await
        .unwrap();

    for _ in 0..200 {
        if tracker.active_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(tracker.active_count(), 1);

    // Never read; the socket buffers fill and the response stalls.
    let mut cut_off = false;
    for _ in 0..80 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if tracker.is_empty() {
            cut_off = true;
            break;
        }
    }
    assert!(
        cut_off,
        "stalled connection still tracked: active={} idle={}",
        tracker.active_count(),
        tracker.idle_count()
    );
    drop(socket);
    servers.stop().await;
}
