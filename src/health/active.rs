//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe one backend
//! - Update its liveness from the probe result
//! - Stop when the shutdown signal fires

use axum::http::Uri;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::http::client::UpstreamClient;
use crate::http::proxy::UpstreamError;
use crate::http::request::UpstreamTarget;
use crate::load_balancer::BackendStatus;
use crate::observability::metrics;

/// Upper bound on a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Probes one backend on a fixed interval.
#[derive(Debug)]
pub struct HealthChecker {
    backend: Arc<BackendStatus>,
    probe_uri: Uri,
    interval: Duration,
    client: UpstreamClient,
}

impl HealthChecker {
    pub fn new(
        backend: Arc<BackendStatus>,
        health_path: &str,
        interval: Duration,
        client: UpstreamClient,
    ) -> Result<Self, UpstreamError> {
        let target = UpstreamTarget::from_url(backend.target())
            .ok_or_else(|| UpstreamError::InvalidTarget(backend.to_string()))?;
        let probe_uri = target.uri_for(health_path, None)?;
        Ok(Self {
            backend,
            probe_uri,
            interval,
            client,
        })
    }

    /// Probe once and record the result. Returns the new liveness.
    pub async fn check_once(&self) -> bool {
        let (alive, reason) = match self.client.probe(self.probe_uri.clone(), PROBE_TIMEOUT).await {
            Ok(status) if status.as_u16() == 200 => (true, None),
            Ok(status) => (false, Some(format!("status {}", status))),
            Err(err) => (false, Some(err.to_string())),
        };

        let backend = self.backend.to_string();
        let was_alive = self.backend.set_alive(alive);
        if was_alive != alive {
            if alive {
                tracing::info!(backend = %backend, "Backend is alive again");
            } else {
                tracing::warn!(
                    backend = %backend,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "Health check failed, backend marked dead"
                );
            }
        }
        metrics::record_backend_health(&backend, alive);
        alive
    }

    /// Probe every interval until shutdown. The first probe happens one
    /// interval after start.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!(
            backend = %self.backend,
            probe = %self.probe_uri,
            interval = ?self.interval,
            "Health checker starting"
        );

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::debug!(backend = %self.backend, "Health checker stopping");
                    break;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use url::Url;

    async fn respond_with(status_line: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status_line
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn checker(addr: std::net::SocketAddr) -> (Arc<BackendStatus>, HealthChecker) {
        let backend = Arc::new(BackendStatus::new(
            Url::parse(&format!("http://{}", addr)).unwrap(),
        ));
        let client = UpstreamClient::new(&UpstreamConfig::default()).unwrap();
        let checker =
            HealthChecker::new(backend.clone(), "/health", Duration::from_secs(15), client)
                .unwrap();
        (backend, checker)
    }

    #[tokio::test]
    async fn probe_uri_joins_health_path() {
        let (_, checker) = checker("127.0.0.1:9000".parse().unwrap());
        assert_eq!(checker.probe_uri.to_string(), "http://127.0.0.1:9000/health");
    }

    #[tokio::test]
    async fn non_200_marks_dead_and_200_revives() {
        let (backend, failing) = checker(respond_with("503 Service Unavailable").await);
        assert!(!failing.check_once().await);
        assert!(!backend.is_alive());

        let (backend, healthy) = checker(respond_with("200 OK").await);
        backend.mark_dead();
        assert!(healthy.check_once().await);
        assert!(backend.is_alive());
    }

    #[tokio::test]
    async fn other_success_codes_are_not_healthy() {
        let (backend, checker) = checker(respond_with("204 No Content").await);
        assert!(!checker.check_once().await);
        assert!(!backend.is_alive());
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (_, checker) = checker("127.0.0.1:9".parse().unwrap());
        let (tx, rx) = broadcast::channel(1);
        let handle = checker.spawn(rx);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
