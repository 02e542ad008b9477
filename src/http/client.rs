//! Pooled HTTP client for upstream traffic.
//!
//! # Responsibilities
//! - Keep idle upstream connections per host (bounded, with idle timeout)
//! - Cap reusable connections process-wide; the overflow is single-use
//! - Bound connect plus TLS handshake time
//! - Send proxied requests and health probes
//!
//! # Design Decisions
//! - One client per process, shared by every proxy and health checker
//! - HTTP/1.1 upstream; `https` upstreams use rustls with webpki roots
//! - The response-header timeout covers the wait for the status line

use axum::body::Body;
use axum::http::header::USER_AGENT;
use axum::http::{Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{BoxError, Service};

use crate::config::UpstreamConfig;
use crate::http::proxy::UpstreamError;

const PROBE_USER_AGENT: &str = "edge-proxy-health-check";

/// Connecting (TCP plus TLS) took longer than allowed.
#[derive(Debug, Error)]
#[error("connect timed out after {0:?}")]
pub struct ConnectTimeout(pub Duration);

/// Wraps a connector so a whole connect attempt is bounded in time and
/// only `max_pooled` connections at a time may return to the pool.
#[derive(Debug, Clone)]
pub struct BoundedConnector<C> {
    inner: C,
    timeout: Duration,
    pool_slots: Arc<Semaphore>,
}

impl<C> BoundedConnector<C> {
    pub fn new(inner: C, timeout: Duration, max_pooled: usize) -> Self {
        Self {
            inner,
            timeout,
            pool_slots: Arc::new(Semaphore::new(max_pooled)),
        }
    }
}

impl<C> Service<Uri> for BoundedConnector<C>
where
    C: Service<Uri>,
    C::Response: Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = PooledIo<C::Response>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let timeout = self.timeout;
        let pool_slots = Arc::clone(&self.pool_slots);
        let connecting = self.inner.call(uri);
        Box::pin(async move {
            let io = match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into)?,
                Err(_) => return Err(Box::new(ConnectTimeout(timeout)) as BoxError),
            };
            let slot = pool_slots.try_acquire_owned().ok();
            if slot.is_none() {
                tracing::debug!("Upstream pool full, connection will not be reused");
            }
            Ok(PooledIo { inner: io, slot })
        })
    }
}

/// Upstream transport that may only be reused while it holds a pool slot.
///
/// The slot is released when the connection closes.
#[derive(Debug)]
pub struct PooledIo<T> {
    inner: T,
    slot: Option<OwnedSemaphorePermit>,
}

impl<T: Connection> Connection for PooledIo<T> {
    fn connected(&self) -> Connected {
        let connected = self.inner.connected();
        if self.slot.is_none() {
            connected.poison();
        }
        connected
    }
}

impl<T: Read + Unpin> Read for PooledIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T: Write + Unpin> Write for PooledIo<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }
}

type Connector = BoundedConnector<HttpsConnector<HttpConnector>>;

/// Shared upstream client.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    inner: Client<Connector, Body>,
    response_timeout: Duration,
}

impl UpstreamClient {
    /// Build the pooled client from the upstream settings.
    pub fn new(config: &UpstreamConfig) -> Result<Self, rustls::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));

        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let connect_budget =
            Duration::from_secs(config.connect_timeout_secs + config.tls_handshake_timeout_secs);

        let inner = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_timer(TokioTimer::new())
            .build(BoundedConnector::new(https, connect_budget, config.max_idle));

        Ok(Self {
            inner,
            response_timeout: Duration::from_secs(config.response_header_timeout_secs),
        })
    }

    /// Send a request, waiting at most the response-header timeout for
    /// the status line. The body streams afterwards without a deadline.
    pub async fn send(&self, request: Request<Body>) -> Result<Response<Body>, UpstreamError> {
        match tokio::time::timeout(self.response_timeout, self.inner.request(request)).await {
            Ok(Ok(response)) => Ok(response.map(Body::new)),
            Ok(Err(err)) => Err(UpstreamError::Transport(err)),
            Err(_) => Err(UpstreamError::Timeout(self.response_timeout)),
        }
    }

    /// Issue a health probe `GET` and return its status.
    pub async fn probe(&self, uri: Uri, timeout: Duration) -> Result<StatusCode, UpstreamError> {
        let request = Request::get(uri)
            .header(USER_AGENT, PROBE_USER_AGENT)
            .body(Body::empty())?;
        match tokio::time::timeout(timeout, self.inner.request(request)).await {
            Ok(Ok(response)) => Ok(response.status()),
            Ok(Err(err)) => Err(UpstreamError::Transport(err)),
            Err(_) => Err(UpstreamError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = UpstreamClient::new(&UpstreamConfig::default()).unwrap();
        let uri: Uri = format!("http://{}/health", addr).parse().unwrap();
        let err = client.probe(uri, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_)), "{err:?}");
    }

    /// Keep-alive upstream that answers every request after `delay` and
    /// counts accepted connections.
    async fn counting_upstream(delay: Duration) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut pending = Vec::new();
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        pending.extend_from_slice(&buf[..n]);
                        while let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
                            pending.drain(..end + 4);
                            tokio::time::sleep(delay).await;
                            let reply = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";
                            if stream.write_all(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        (addr, accepted)
    }

    async fn fetch_pair(client: &UpstreamClient, uri: &Uri) {
        let send = move |uri: Uri| async move {
            let response = client
                .send(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            axum::body::to_bytes(response.into_body(), 64).await.unwrap();
        };
        tokio::join!(send(uri.clone()), send(uri.clone()));
    }

    #[tokio::test]
    async fn connections_beyond_pool_cap_are_not_reused() {
        let (addr, accepted) = counting_upstream(Duration::from_millis(200)).await;
        let uri: Uri = format!("http://{}/", addr).parse().unwrap();

        let capped = UpstreamClient::new(&UpstreamConfig {
            max_idle: 1,
            ..Default::default()
        })
        .unwrap();
        fetch_pair(&capped, &uri).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        // Only the slot holder went back to the pool, so the second pair
        // needs one fresh connection.
        fetch_pair(&capped, &uri).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = UpstreamClient::new(&UpstreamConfig::default()).unwrap();
        let uri: Uri = format!("http://{}/health", addr).parse().unwrap();
        let err = client
            .probe(uri, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout(_)), "{err:?}");
    }
}
