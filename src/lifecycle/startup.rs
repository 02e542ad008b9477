//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Build the shared upstream client and rate limiter
//! - Bind every listener, all or nothing
//! - Spawn listeners and hand back a handle to stop them
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Every listener failure is reported, not just the first
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{validate_config, ProxyConfig, ValidationError};
use crate::http::client::UpstreamClient;
use crate::http::server::{EdgeListener, ListenerResources, ListenerState, StartupError};
use crate::lifecycle::{signals, Shutdown};
use crate::net::ConnectionTracker;
use crate::security::RateLimiter;

/// A listener that could not be started.
#[derive(Debug)]
pub struct ListenerFailure {
    pub address: String,
    pub error: StartupError,
}

impl std::fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.address, self.error)
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why the server set did not start.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid configuration: {}", join(.0))]
    Config(Vec<ValidationError>),

    #[error("failed to build upstream client: {0}")]
    Client(#[from] rustls::Error),

    #[error("{} listener(s) failed to start: {}", .0.len(), join(.0))]
    Listeners(Vec<ListenerFailure>),
}

/// Observation handle for one running listener.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    state: watch::Receiver<ListenerState>,
    tracker: ConnectionTracker,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// A receiver for lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }
}

/// Every configured listener, running as a unit.
#[derive(Debug)]
pub struct EdgeServerSet {
    shutdown: Shutdown,
    listeners: Vec<ListenerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl EdgeServerSet {
    /// Validate, bind every listener and start serving.
    ///
    /// When any listener fails to bind, every listener already bound is
    /// released, health checkers are stopped, and all failures are returned.
    pub async fn start(config: &ProxyConfig) -> Result<Self, StartError> {
        validate_config(config).map_err(StartError::Config)?;

        let shutdown = Shutdown::new();
        let resources = ListenerResources {
            client: UpstreamClient::new(&config.upstream)?,
            shutdown: shutdown.clone(),
            rate_limiter: config
                .rate_limit
                .enabled
                .then(|| Arc::new(RateLimiter::new(&config.rate_limit))),
        };

        let mut bound = Vec::with_capacity(config.listeners.len());
        let mut failures = Vec::new();
        for listener_config in &config.listeners {
            match EdgeListener::bind(listener_config, config, &resources).await {
                Ok(listener) => bound.push(listener),
                Err(error) => {
                    tracing::error!(
                        address = %listener_config.listen_address,
                        error = %error,
                        "Listener failed to start"
                    );
                    failures.push(ListenerFailure {
                        address: listener_config.listen_address.clone(),
                        error,
                    });
                }
            }
        }

        if !failures.is_empty() {
            shutdown.trigger();
            drop(bound);
            return Err(StartError::Listeners(failures));
        }

        let mut listeners = Vec::with_capacity(bound.len());
        let mut tasks = Vec::with_capacity(bound.len());
        for listener in bound {
            let handle = ListenerHandle {
                local_addr: listener.local_addr(),
                state: listener.state(),
                tracker: listener.tracker(),
            };
            tasks.push(tokio::spawn(listener.run(shutdown.subscribe())));
            listeners.push(handle);
        }

        for handle in &listeners {
            let mut state = handle.watch_state();
            let _ = state.wait_for(|s| *s == ListenerState::Serving).await;
        }

        tracing::info!(listeners = listeners.len(), "Edge server set started");
        Ok(Self {
            shutdown,
            listeners,
            tasks,
        })
    }

    pub fn listeners(&self) -> &[ListenerHandle] {
        &self.listeners
    }

    /// Bound addresses in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(ListenerHandle::local_addr).collect()
    }

    /// Stop every listener and wait until each has closed.
    pub async fn stop(self) {
        tracing::info!("Stopping edge server set");
        self.shutdown.trigger();
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "Listener task failed");
            }
        }
        tracing::info!("Edge server set stopped");
    }

    /// Serve until SIGINT or SIGTERM, then stop.
    pub async fn run_until_signal(self) {
        signals::shutdown_signal().await;
        self.stop().await;
    }
}
