//! Per-listener middleware chain.
//!
//! # Layer Order (outermost first)
//! ```text
//! request id (set + propagate)
//!     → rate limit            (optional)
//!     → security headers      (optional)
//!     → access log
//!     → gzip compression
//!     → virtual host dispatch
//! ```
//! Every listener gets the same chain; only its host table differs.
//!
//! There is no whole-request deadline here. Upstream attempts carry their own
//! connect and response-header timeouts so failover and 504 stay reachable,
//! and the connection enforces header-read, write and idle limits.

pub mod compression;

use axum::{
    extract::{Request, State},
    middleware,
    response::Response,
    Router,
};
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

use crate::http::request::MakeRequestUuid;
use crate::observability::access_log::access_log;
use crate::routing::VirtualHostRegistry;
use crate::security::{headers, rate_limit_middleware, RateLimiter};

pub use compression::{compress_predicate, TextualContent};

/// Toggles and limits for the chain.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub security_headers: bool,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

async fn dispatch(State(registry): State<Arc<VirtualHostRegistry>>, request: Request) -> Response {
    registry.dispatch(request).await
}

/// Wrap a host table in the standard middleware chain.
pub fn build_chain(registry: Arc<VirtualHostRegistry>, settings: &ChainSettings) -> Router {
    let mut router = Router::new()
        .fallback(dispatch)
        .with_state(registry)
        .layer(CompressionLayer::new().compress_when(compress_predicate()))
        .layer(middleware::from_fn(access_log));

    if settings.security_headers {
        router = headers::apply(router);
    }

    if let Some(limiter) = &settings.rate_limiter {
        router = router.layer(middleware::from_fn_with_state(
            limiter.clone(),
            rate_limit_middleware,
        ));
    }

    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
