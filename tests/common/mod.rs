//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use edge_proxy::config::{
    LbPolicy, ListenerConfig, ProxyConfig, RouteConfig, VirtualHostConfig,
};

/// A request as seen by a mock backend.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A raw-TCP HTTP/1.1 backend that answers with its own name.
///
/// `/health` answers 200 while healthy and 503 otherwise; every other path
/// answers `status` with the backend name as body, after `delay`.
#[derive(Debug, Clone)]
pub struct MockBackend {
    pub addr: SocketAddr,
    pub name: &'static str,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    healthy: Arc<AtomicBool>,
    status: Arc<AtomicU16>,
}

impl MockBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Non-health requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path != "/health")
            .cloned()
            .collect()
    }

    pub fn hits(&self) -> usize {
        self.requests().len()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }
}

pub async fn start_backend(name: &'static str) -> MockBackend {
    start_slow_backend(name, Duration::ZERO).await
}

pub async fn start_slow_backend(name: &'static str, delay: Duration) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = MockBackend {
        addr: listener.local_addr().unwrap(),
        name,
        requests: Arc::new(Mutex::new(Vec::new())),
        healthy: Arc::new(AtomicBool::new(true)),
        status: Arc::new(AtomicU16::new(200)),
    };

    let shared = backend.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let backend = shared.clone();
            tokio::spawn(async move {
                let _ = serve_one(socket, backend, delay).await;
            });
        }
    });
    backend
}

async fn serve_one(
    mut socket: TcpStream,
    backend: MockBackend,
    delay: Duration,
) -> std::io::Result<()> {
    let Some(request) = read_request(&mut socket).await? else {
        return Ok(());
    };
    let is_health = request.path == "/health";
    backend.requests.lock().unwrap().push(request);

    let (status, body) = if is_health {
        if backend.healthy.load(Ordering::SeqCst) {
            (200, "ok".to_string())
        } else {
            (503, "unhealthy".to_string())
        }
    } else {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (backend.status.load(Ordering::SeqCst), backend.name.to_string())
    };

    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nX-Backend: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason(status),
        backend.name,
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Read one HTTP/1.1 request (headers plus Content-Length body).
pub async fn read_request(socket: &mut TcpStream) -> std::io::Result<Option<RecordedRequest>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[header_end..].to_vec();
    while body.len() < length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Ok(Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    }))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A backend that switches to an echo protocol when asked with
/// `Connection: Upgrade` plus `Upgrade: echo`, then returns every byte it
/// receives. Other requests get 400.
pub async fn start_upgrade_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(Some(request)) = read_request(&mut socket).await else {
                    return;
                };
                let asked = request
                    .header("connection")
                    .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
                    && request.header("upgrade") == Some("echo");
                if !asked {
                    let _ = socket
                        .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                    return;
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
                    .await;
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// An address with nothing listening on it.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn proxy_host(hostname: &str, upstream: &str) -> VirtualHostConfig {
    VirtualHostConfig {
        hostname: hostname.to_string(),
        proxy: Some(upstream.to_string()),
        ..Default::default()
    }
}

pub fn static_host(hostname: &str, root: &Path) -> VirtualHostConfig {
    VirtualHostConfig {
        hostname: hostname.to_string(),
        root_dir: Some(root.display().to_string()),
        ..Default::default()
    }
}

pub fn balanced_host(hostname: &str, backends: Vec<String>, policy: LbPolicy) -> VirtualHostConfig {
    VirtualHostConfig {
        hostname: hostname.to_string(),
        backends,
        lb_policy: policy,
        ..Default::default()
    }
}

pub fn routed_host(hostname: &str, routes: Vec<RouteConfig>) -> VirtualHostConfig {
    VirtualHostConfig {
        hostname: hostname.to_string(),
        routes,
        ..Default::default()
    }
}

pub fn proxy_route(path: &str, upstream: &str) -> RouteConfig {
    RouteConfig {
        path: path.to_string(),
        proxy: Some(upstream.to_string()),
        root_dir: None,
    }
}

pub fn static_route(path: &str, root: &Path) -> RouteConfig {
    RouteConfig {
        path: path.to_string(),
        proxy: None,
        root_dir: Some(root.display().to_string()),
    }
}

pub fn listener(virtual_hosts: Vec<VirtualHostConfig>) -> ListenerConfig {
    ListenerConfig {
        listen_address: "127.0.0.1:0".to_string(),
        tls: None,
        virtual_hosts,
    }
}

/// Test defaults: no rate limiting, short drain window.
pub fn config(listeners: Vec<ListenerConfig>) -> ProxyConfig {
    let mut config = ProxyConfig {
        listeners,
        ..Default::default()
    };
    config.rate_limit.enabled = false;
    config.timeouts.shutdown_secs = 5;
    config
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// GET through the proxy with an explicit Host header.
pub async fn get(
    client: &reqwest::Client,
    proxy: SocketAddr,
    host: &str,
    path: &str,
) -> reqwest::Response {
    client
        .get(format!("http://{}{}", proxy, path))
        .header("host", host)
        .send()
        .await
        .unwrap()
}
