//! Response handling and transformation.
//!
//! # Responsibilities
//! - Map proxy failures to appropriate HTTP status codes
//! - Build the error bodies the proxy itself originates
//!
//! # Design Decisions
//! - Upstream status codes (including 4xx/5xx) pass through untouched
//! - Backend timeouts result in 504 Gateway Timeout
//! - Transport failures result in 502 Bad Gateway

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::http::proxy::UpstreamError;

/// 404 for a Host no virtual host claims.
pub fn unknown_host(host: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "unknown host", "host": host })),
    )
        .into_response()
}

/// 404 for a path no route rule matches.
pub fn no_route() -> Response {
    (StatusCode::NOT_FOUND, "No route for path").into_response()
}

/// 503 once every failover attempt is spent.
pub fn service_unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable").into_response()
}

/// 429 from the rate limiter.
pub fn too_many_requests() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response()
}

/// 413 when a body cannot be buffered for replay.
pub fn payload_too_large() -> Response {
    (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response()
}

/// 502 or 504 for a failed forward.
pub fn upstream_failure(error: &UpstreamError) -> Response {
    let status = error.status();
    let message = if status == StatusCode::GATEWAY_TIMEOUT {
        "Upstream timed out"
    } else {
        "Upstream request failed"
    };
    (status, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn unknown_host_body_names_host() {
        let response = unknown_host("nope.example.com");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["host"], "nope.example.com");
        assert_eq!(value["error"], "unknown host");
    }

    #[test]
    fn timeout_maps_to_504() {
        let err = UpstreamError::Timeout(std::time::Duration::from_secs(1));
        assert_eq!(upstream_failure(&err).status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
