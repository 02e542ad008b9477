//! Edge listener: one listening socket and everything behind it.
//!
//! # Responsibilities
//! - Bind the socket and load TLS material (fail fast)
//! - Build the listener's virtual host table and middleware chain
//! - Accept connections, register them before any request runs
//! - Serve HTTP/1.1 and HTTP/2 (ALPN-negotiated on TLS)
//! - Cut off peers that stop reading a response (write stall timeout)
//! - Drain on stop, force-closing whatever outlives the drain window
//!
//! # Lifecycle
//! ```text
//! Unbound → Bound → Serving → Draining → Closed
//! ```

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::header::STRICT_TRANSPORT_SECURITY;
use axum::http::{HeaderValue, Request, Response, StatusCode};
use axum::Router;
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;

use crate::config::{parse_listen_address, ListenerConfig, ProxyConfig};
use crate::http::client::UpstreamClient;
use crate::http::middleware::{build_chain, ChainSettings};
use crate::http::request::TlsConnection;
use crate::lifecycle::Shutdown;
use crate::net::connection::InFlightRequest;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::net::tls::{self, TlsError};
use crate::net::{ConnectionTracker, TrackedConnection, WriteTimeout};
use crate::routing::{HandlerContext, RegistryError, VirtualHostRegistry};
use crate::security::RateLimiter;

/// Pause after a failed accept, so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Extra time given to force-closed connections to release their sockets.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why a listener could not be brought up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("malformed listen address '{0}'")]
    InvalidAddress(String),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Observable listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unbound,
    Bound,
    Serving,
    Draining,
    Closed,
}

/// Process-wide resources shared by every listener.
#[derive(Debug, Clone)]
pub struct ListenerResources {
    pub client: UpstreamClient,
    pub shutdown: Shutdown,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

#[derive(Debug, Clone, Copy)]
struct ServeTimeouts {
    header_read: Duration,
    write: Duration,
    tls_handshake: Duration,
    drain: Duration,
    sweep_interval: Duration,
}

/// A bound listener with its own host table and connection tracker.
pub struct EdgeListener {
    address: String,
    local_addr: SocketAddr,
    listener: Listener,
    tls: Option<TlsAcceptor>,
    hsts: Option<HeaderValue>,
    app: Router,
    tracker: ConnectionTracker,
    timeouts: ServeTimeouts,
    state: watch::Sender<ListenerState>,
}

impl std::fmt::Debug for EdgeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeListener")
            .field("address", &self.address)
            .field("local_addr", &self.local_addr)
            .field("tls", &self.tls.is_some())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl EdgeListener {
    /// Resolve TLS material, build the host table and bind the socket.
    pub async fn bind(
        listener_config: &ListenerConfig,
        config: &ProxyConfig,
        resources: &ListenerResources,
    ) -> Result<Self, StartupError> {
        let (state, _) = watch::channel(ListenerState::Unbound);
        let address = listener_config.listen_address.clone();
        let addr = parse_listen_address(&address)
            .map_err(|_| StartupError::InvalidAddress(address.clone()))?;

        let (tls, hsts) = match listener_config.active_tls() {
            Some(tls_config) => (
                Some(tls::load_acceptor(tls_config)?),
                tls::hsts_header(tls_config.hsts_max_age),
            ),
            None => (None, None),
        };

        let registry = VirtualHostRegistry::from_config(
            &listener_config.virtual_hosts,
            HandlerContext {
                client: &resources.client,
                shutdown: &resources.shutdown,
                max_body_size: config.security.max_body_size,
            },
        )?;
        let app = build_chain(
            Arc::new(registry),
            &ChainSettings {
                security_headers: config.security.enable_headers,
                rate_limiter: resources.rate_limiter.clone(),
            },
        );

        let listener = Listener::bind(addr, config.connections.max_connections).await?;
        let local_addr = listener.local_addr();

        let tracker = ConnectionTracker::new(
            local_addr.to_string(),
            config.connections.max_idle,
            Duration::from_secs(config.timeouts.idle_secs),
        );
        state.send_replace(ListenerState::Bound);

        tracing::info!(
            address = %address,
            local_addr = %local_addr,
            tls = tls.is_some(),
            virtual_hosts = listener_config.virtual_hosts.len(),
            "Listener ready"
        );

        Ok(Self {
            address,
            local_addr,
            listener,
            tls,
            hsts,
            app,
            tracker,
            timeouts: ServeTimeouts {
                header_read: Duration::from_secs(config.timeouts.read_header_secs),
                write: Duration::from_secs(config.timeouts.write_secs),
                tls_handshake: Duration::from_secs(config.timeouts.tls_handshake_secs),
                drain: Duration::from_secs(config.timeouts.shutdown_secs),
                sweep_interval: Duration::from_secs(config.connections.sweep_interval_secs.max(1)),
            },
            state,
        })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Watch the lifecycle state.
    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Serve until `stop` fires, then drain and close.
    pub async fn run(self, mut stop: broadcast::Receiver<()>) {
        let Self {
            address,
            local_addr,
            listener,
            tls,
            hsts,
            app,
            tracker,
            timeouts,
            state,
        } = self;

        let (drain_tx, drain_rx) = watch::channel(false);
        let sweeper = tokio::spawn(
            tracker
                .clone()
                .run_sweeper(timeouts.sweep_interval, drain_rx.clone()),
        );
        let context = Arc::new(ConnectionContext {
            app,
            tls,
            hsts,
            tracker: tracker.clone(),
            timeouts,
        });

        state.send_replace(ListenerState::Serving);
        tracing::info!(address = %address, local_addr = %local_addr, "Listener serving");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        // Registered here, before the task runs, so a drain that
                        // starts right after accept still waits for it.
                        let tracked = context.tracker.register(peer);
                        tokio::spawn(serve_connection(
                            Arc::clone(&context),
                            stream,
                            peer,
                            permit,
                            tracked,
                            drain_rx.clone(),
                        ));
                    }
                    Err(err) => {
                        tracing::warn!(address = %address, error = %err, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                _ = stop.recv() => break,
            }
        }

        drop(listener);
        state.send_replace(ListenerState::Draining);
        drain_tx.send_replace(true);
        tracing::info!(
            address = %address,
            connections = tracker.len(),
            timeout = ?timeouts.drain,
            "Listener draining"
        );

        if tokio::time::timeout(timeouts.drain, tracker.wait_until_empty())
            .await
            .is_err()
        {
            let closed = tracker.close_all();
            tracing::warn!(
                address = %address,
                closed,
                "Drain window elapsed, force-closing connections"
            );
            let _ = tokio::time::timeout(FORCE_CLOSE_GRACE, tracker.wait_until_empty()).await;
        }

        sweeper.abort();
        state.send_replace(ListenerState::Closed);
        tracing::info!(address = %address, "Listener closed");
    }
}

struct ConnectionContext {
    app: Router,
    tls: Option<TlsAcceptor>,
    hsts: Option<HeaderValue>,
    tracker: ConnectionTracker,
    timeouts: ServeTimeouts,
}

async fn serve_connection(
    context: Arc<ConnectionContext>,
    stream: TcpStream,
    peer: SocketAddr,
    _permit: ConnectionPermit,
    tracked: TrackedConnection,
    drain: watch::Receiver<bool>,
) {
    let Some(acceptor) = context.tls.clone() else {
        serve_io(&context, stream, peer, false, &tracked, drain).await;
        return;
    };

    let handshake = tokio::time::timeout(context.timeouts.tls_handshake, acceptor.accept(stream));
    let stream = tokio::select! {
        result = handshake => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::debug!(peer_addr = %peer, error = %err, "TLS handshake failed");
                return;
            }
            Err(_) => {
                tracing::debug!(peer_addr = %peer, "TLS handshake timed out");
                return;
            }
        },
        _ = tracked.closed() => return,
    };
    serve_io(&context, stream, peer, true, &tracked, drain).await;
}

async fn serve_io<I>(
    context: &ConnectionContext,
    io: I,
    peer: SocketAddr,
    secure: bool,
    tracked: &TrackedConnection,
    mut drain: watch::Receiver<bool>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let app = context.app.clone();
    let hsts = context.hsts.clone();
    let activity = tracked.activity();

    let service = service_fn(move |mut request: Request<Incoming>| {
        let app = app.clone();
        let hsts = hsts.clone();
        let in_flight = activity.begin_request();
        async move {
            request.extensions_mut().insert(ConnectInfo(peer));
            if secure {
                request.extensions_mut().insert(TlsConnection);
            }

            let response = match app.oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
            let (mut parts, body) = response.into_parts();
            if let Some(value) = hsts {
                parts.headers.insert(STRICT_TRANSPORT_SECURITY, value);
            }
            if parts.status == StatusCode::SWITCHING_PROTOCOLS {
                in_flight.hijack();
            }
            Ok::<_, Infallible>(Response::from_parts(parts, TrackedBody::new(body, in_flight)))
        }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(context.timeouts.header_read);
    let io = WriteTimeout::new(io, context.timeouts.write);
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(connection);

    let mut draining = *drain.borrow();
    if draining {
        connection.as_mut().graceful_shutdown();
    }

    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(err) = result {
                    tracing::debug!(peer_addr = %peer, error = %err, "Connection ended with error");
                }
                break;
            }
            changed = drain.changed(), if !draining => {
                draining = true;
                if changed.is_ok() {
                    connection.as_mut().graceful_shutdown();
                }
            }
            _ = tracked.retired(), if !draining => {
                tracing::debug!(peer_addr = %peer, connection_id = %tracked.id(), "Connection retired");
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
            _ = tracked.closed() => {
                tracing::debug!(peer_addr = %peer, connection_id = %tracked.id(), "Connection force-closed");
                break;
            }
        }
    }
}

/// Response body that holds the in-flight marker until fully written or dropped.
struct TrackedBody {
    inner: Body,
    _in_flight: InFlightRequest,
}

impl TrackedBody {
    fn new(inner: Body, in_flight: InFlightRequest) -> Self {
        Self {
            inner,
            _in_flight: in_flight,
        }
    }
}

impl HttpBody for TrackedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
