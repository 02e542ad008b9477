//! Single-upstream reverse proxy.
//!
//! # Responsibilities
//! - Rewrite inbound requests onto an upstream target
//! - Stream upstream responses back, minus hop-by-hop headers
//! - Tunnel protocol upgrades (e.g. WebSocket) once the upstream answers 101
//! - Map forwarding failures to 502/504

use axum::body::Body;
use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::http::client::UpstreamClient;
use crate::http::request::{
    strip_hop_by_hop, strip_hop_by_hop_keep_upgrade, upgrade_protocol, upstream_request,
    UpstreamTarget,
};
use crate::http::response;

/// Why a forward to an upstream failed.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream target '{0}'")]
    InvalidTarget(String),

    #[error("failed to build upstream request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("upstream transport error: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    /// Status returned to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Forwards every request to one upstream.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    target: UpstreamTarget,
    client: UpstreamClient,
}

impl ReverseProxy {
    pub fn new(target: &Url, client: UpstreamClient) -> Result<Self, UpstreamError> {
        let target = UpstreamTarget::from_url(target)
            .ok_or_else(|| UpstreamError::InvalidTarget(target.to_string()))?;
        Ok(Self { target, client })
    }

    /// Parse and build from a raw URL string.
    pub fn parse(raw: &str, client: UpstreamClient) -> Result<Self, UpstreamError> {
        let url = Url::parse(raw).map_err(|_| UpstreamError::InvalidTarget(raw.to_string()))?;
        Self::new(&url, client)
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Forward once, surfacing failures to the caller.
    pub async fn forward(&self, parts: &Parts, body: Body) -> Result<Response, UpstreamError> {
        let request = upstream_request(parts, &self.target, body)?;
        let mut upstream = self.client.send(request).await?;
        if upstream.status() == StatusCode::SWITCHING_PROTOCOLS {
            strip_hop_by_hop_keep_upgrade(upstream.headers_mut());
        } else {
            strip_hop_by_hop(upstream.headers_mut());
        }
        Ok(upstream)
    }

    /// Forward and turn failures into 502/504 responses.
    pub async fn handle(&self, mut request: Request) -> Response {
        let client_upgrade = take_upgrade(&mut request);
        let (parts, body) = request.into_parts();
        match self.forward(&parts, body).await {
            Ok(mut upstream) => {
                if let Some(client) = client_upgrade {
                    tunnel_upgrade(client, &mut upstream);
                }
                upstream
            }
            Err(err) => {
                tracing::warn!(
                    upstream = %self.target,
                    method = %parts.method,
                    path = %parts.uri.path(),
                    error = %err,
                    "Upstream request failed"
                );
                response::upstream_failure(&err)
            }
        }
    }
}

/// The client side of a pending protocol switch, if the request asks for one.
pub fn take_upgrade(request: &mut Request) -> Option<OnUpgrade> {
    upgrade_protocol(request.headers()).map(|_| hyper::upgrade::on(request))
}

/// Once the upstream has agreed to switch protocols, splice the two upgraded
/// connections together in a background task. Other statuses leave the
/// client upgrade unused, which hyper treats as declined.
pub fn tunnel_upgrade(client: OnUpgrade, upstream: &mut Response) {
    if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
        return;
    }
    let upstream = hyper::upgrade::on(upstream);
    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client, upstream) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::debug!(error = %err, "Protocol upgrade did not complete");
                return;
            }
        };
        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => {
                tracing::debug!(sent, received, "Upgraded connection closed");
            }
            Err(err) => tracing::debug!(error = %err, "Upgraded connection failed"),
        }
    });
}
