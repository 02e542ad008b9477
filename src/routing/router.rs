//! Virtual host lookup and dispatch.
//!
//! # Responsibilities
//! - Build one handler per configured virtual host
//! - Look up the handler for a request's Host
//! - Answer unknown hosts with an explicit 404
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(1) host lookup via HashMap on the normalized hostname
//! - Explicit unknown-host response rather than a silent default

use axum::extract::Request;
use axum::response::Response;
use std::collections::HashMap;
use thiserror::Error;

use crate::config::VirtualHostConfig;
use crate::health::HealthChecker;
use crate::http::client::UpstreamClient;
use crate::http::proxy::{ReverseProxy, UpstreamError};
use crate::http::request::request_host;
use crate::http::response;
use crate::http::static_files::StaticFiles;
use crate::lifecycle::Shutdown;
use crate::load_balancer::LoadBalancer;
use crate::routing::matcher::normalize_host;
use crate::routing::path_router::{PathRouter, RouteRule, RouteTarget};

/// Failure to build the host table.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("hostname '{0}' is already registered")]
    DuplicateHost(String),

    #[error("virtual host '{hostname}' needs exactly one backend strategy, found {count}")]
    Strategy { hostname: String, count: usize },

    #[error("virtual host '{hostname}': {source}")]
    Upstream {
        hostname: String,
        #[source]
        source: UpstreamError,
    },
}

/// Shared resources needed to build handlers.
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext<'a> {
    pub client: &'a UpstreamClient,
    pub shutdown: &'a Shutdown,
    pub max_body_size: usize,
}

/// The single backend strategy of a virtual host.
#[derive(Debug)]
pub enum HostHandler {
    Proxy(ReverseProxy),
    Static(StaticFiles),
    Balanced(LoadBalancer),
    Routed(PathRouter),
}

impl HostHandler {
    /// Build the handler for a virtual host. Balanced hosts also start one
    /// health checker per backend, stopped by `ctx.shutdown`.
    pub fn from_config(vhost: &VirtualHostConfig, ctx: HandlerContext<'_>) -> Result<Self, RegistryError> {
        let upstream_err = |source| RegistryError::Upstream {
            hostname: vhost.hostname.clone(),
            source,
        };

        if vhost.strategy_count() != 1 {
            return Err(RegistryError::Strategy {
                hostname: vhost.hostname.clone(),
                count: vhost.strategy_count(),
            });
        }

        if let Some(proxy) = vhost.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = ReverseProxy::parse(proxy, ctx.client.clone()).map_err(upstream_err)?;
            return Ok(HostHandler::Proxy(proxy));
        }

        if let Some(root) = vhost.root_dir.as_deref().filter(|r| !r.is_empty()) {
            return Ok(HostHandler::Static(StaticFiles::new(root)));
        }

        if !vhost.backends.is_empty() {
            let balancer = LoadBalancer::new(
                &vhost.backends,
                vhost.lb_policy,
                ctx.client.clone(),
                ctx.max_body_size,
            )
            .map_err(upstream_err)?;

            for backend in balancer.backends() {
                let checker = HealthChecker::new(
                    backend.clone(),
                    vhost.effective_health_path(),
                    vhost.effective_health_interval(),
                    ctx.client.clone(),
                )
                .map_err(upstream_err)?;
                checker.spawn(ctx.shutdown.subscribe());
            }
            return Ok(HostHandler::Balanced(balancer));
        }

        let rules = vhost
            .routes
            .iter()
            .map(|route| {
                let target = match route.proxy.as_deref().filter(|p| !p.is_empty()) {
                    Some(proxy) => RouteTarget::Proxy(
                        ReverseProxy::parse(proxy, ctx.client.clone()).map_err(upstream_err)?,
                    ),
                    None => RouteTarget::Static(StaticFiles::new(
                        route.root_dir.as_deref().unwrap_or_default(),
                    )),
                };
                Ok(RouteRule::new(route.path.clone(), target))
            })
            .collect::<Result<Vec<_>, RegistryError>>()?;
        Ok(HostHandler::Routed(PathRouter::new(rules)))
    }

    /// Strategy name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            HostHandler::Proxy(_) => "proxy",
            HostHandler::Static(_) => "static",
            HostHandler::Balanced(_) => "balanced",
            HostHandler::Routed(_) => "routed",
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match self {
            HostHandler::Proxy(proxy) => proxy.handle(request).await,
            HostHandler::Static(files) => files.handle(request).await,
            HostHandler::Balanced(balancer) => balancer.handle(request).await,
            HostHandler::Routed(router) => router.handle(request).await,
        }
    }
}

/// Hostname → handler table for one listener.
#[derive(Debug, Default)]
pub struct VirtualHostRegistry {
    hosts: HashMap<String, HostHandler>,
}

impl VirtualHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table for a listener's virtual hosts.
    pub fn from_config(
        vhosts: &[VirtualHostConfig],
        ctx: HandlerContext<'_>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for vhost in vhosts {
            let handler = HostHandler::from_config(vhost, ctx)?;
            tracing::info!(
                hostname = %vhost.hostname,
                strategy = handler.kind(),
                "Virtual host registered"
            );
            registry.register(&vhost.hostname, handler)?;
        }
        Ok(registry)
    }

    /// Add a host. Hostnames compare case-insensitively.
    pub fn register(&mut self, hostname: &str, handler: HostHandler) -> Result<(), RegistryError> {
        let key = normalize_host(hostname);
        if self.hosts.contains_key(&key) {
            return Err(RegistryError::DuplicateHost(hostname.to_string()));
        }
        self.hosts.insert(key, handler);
        Ok(())
    }

    /// Handler for a Host value; any port is ignored.
    pub fn resolve(&self, host: &str) -> Option<&HostHandler> {
        self.hosts.get(&normalize_host(host))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Route a request to its virtual host.
    pub async fn dispatch(&self, request: Request) -> Response {
        let host = request_host(request.headers(), request.uri())
            .unwrap_or_default()
            .to_string();
        match self.resolve(&host) {
            Some(handler) => handler.handle(request).await,
            None => {
                tracing::debug!(host = %host, "Unknown host");
                response::unknown_host(&host)
            }
        }
    }
}
