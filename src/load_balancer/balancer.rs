//! Failover load balancer over a fixed backend set.
//!
//! # Responsibilities
//! - Buffer the request body so it can be replayed on another backend
//! - Pick backends through the configured `Selector`, skipping dead ones
//! - Mark a backend dead on transport failure and try again
//! - Give up with 503 after 2×N attempts

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::response::Response;
use std::sync::Arc;
use url::Url;

use crate::config::LbPolicy;
use crate::http::client::UpstreamClient;
use crate::http::proxy::{take_upgrade, tunnel_upgrade, ReverseProxy, UpstreamError};
use crate::http::response;
use crate::load_balancer::{selector_for, BackendStatus, Selector};
use crate::observability::metrics;

#[derive(Debug)]
struct Member {
    status: Arc<BackendStatus>,
    proxy: ReverseProxy,
}

/// Spreads requests over backends and fails over on transport errors.
#[derive(Debug)]
pub struct LoadBalancer {
    members: Vec<Member>,
    selector: Box<dyn Selector>,
    max_body_size: usize,
}

impl LoadBalancer {
    pub fn new(
        targets: &[String],
        policy: LbPolicy,
        client: UpstreamClient,
        max_body_size: usize,
    ) -> Result<Self, UpstreamError> {
        Self::with_selector(targets, selector_for(policy), client, max_body_size)
    }

    pub fn with_selector(
        targets: &[String],
        selector: Box<dyn Selector>,
        client: UpstreamClient,
        max_body_size: usize,
    ) -> Result<Self, UpstreamError> {
        if targets.is_empty() {
            return Err(UpstreamError::InvalidTarget("empty backend list".to_string()));
        }
        let members = targets
            .iter()
            .map(|raw| {
                let url = Url::parse(raw).map_err(|_| UpstreamError::InvalidTarget(raw.clone()))?;
                Ok(Member {
                    proxy: ReverseProxy::new(&url, client.clone())?,
                    status: Arc::new(BackendStatus::new(url)),
                })
            })
            .collect::<Result<Vec<_>, UpstreamError>>()?;

        Ok(Self {
            members,
            selector,
            max_body_size,
        })
    }

    /// Liveness records, shared with the health checkers.
    pub fn backends(&self) -> impl Iterator<Item = &Arc<BackendStatus>> {
        self.members.iter().map(|m| &m.status)
    }

    /// Selection attempts allowed per request.
    pub fn max_attempts(&self) -> usize {
        2 * self.members.len()
    }

    pub async fn handle(&self, mut request: Request) -> Response {
        let mut client_upgrade = take_upgrade(&mut request);
        let (parts, body) = request.into_parts();
        let body = match to_bytes(body, self.max_body_size).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(
                    path = %parts.uri.path(),
                    limit = self.max_body_size,
                    error = %err,
                    "Request body could not be buffered for failover"
                );
                return response::payload_too_large();
            }
        };

        let count = self.members.len();
        for attempt in 1..=self.max_attempts() {
            let member = &self.members[self.selector.pick(count)];

            // Liveness can change between this read and the forward below. A
            // stale "alive" costs one failed attempt, a stale "dead" one skip.
            if !member.status.is_alive() {
                continue;
            }

            match member.proxy.forward(&parts, Body::from(body.clone())).await {
                Ok(mut upstream) => {
                    if let Some(client) = client_upgrade.take() {
                        tunnel_upgrade(client, &mut upstream);
                    }
                    return upstream;
                }
                Err(UpstreamError::Request(err)) => {
                    tracing::warn!(error = %err, "Failed to build upstream request");
                    return response::upstream_failure(&UpstreamError::Request(err));
                }
                Err(err) => {
                    let backend = member.status.to_string();
                    if member.status.mark_dead() {
                        tracing::warn!(backend = %backend, error = %err, "Backend marked dead");
                        metrics::record_backend_health(&backend, false);
                    }
                    metrics::record_failover(&backend);
                    tracing::debug!(
                        attempt,
                        backend = %backend,
                        "Retrying on another backend"
                    );
                }
            }
        }

        tracing::warn!(
            path = %parts.uri.path(),
            attempts = self.max_attempts(),
            "No live backend answered"
        );
        response::service_unavailable()
    }
}
