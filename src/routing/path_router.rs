//! Path-prefix routing inside a virtual host.
//!
//! # Design Decisions
//! - Rules are scanned in declaration order; the first matching prefix wins
//! - The matched prefix is stripped before delegating
//! - A path no rule matches is answered with 404

use axum::extract::Request;
use axum::response::Response;

use crate::http::proxy::ReverseProxy;
use crate::http::request::with_path;
use crate::http::response;
use crate::http::static_files::StaticFiles;
use crate::routing::matcher::PathPrefixMatcher;

/// Where a matched route sends the request.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    Proxy(ReverseProxy),
    Static(StaticFiles),
}

/// One prefix rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    matcher: PathPrefixMatcher,
    target: RouteTarget,
}

impl RouteRule {
    pub fn new(prefix: impl Into<String>, target: RouteTarget) -> Self {
        Self {
            matcher: PathPrefixMatcher::new(prefix),
            target,
        }
    }

    pub fn prefix(&self) -> &str {
        self.matcher.prefix()
    }
}

/// Ordered list of prefix rules.
#[derive(Debug, Clone, Default)]
pub struct PathRouter {
    rules: Vec<RouteRule>,
}

impl PathRouter {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    /// First rule whose prefix matches `path`.
    pub fn find(&self, path: &str) -> Option<&RouteRule> {
        self.rules.iter().find(|rule| rule.matcher.matches(path))
    }

    pub async fn handle(&self, mut request: Request) -> Response {
        let Some(rule) = self.find(request.uri().path()) else {
            tracing::debug!(path = %request.uri().path(), "No route matched");
            return response::no_route();
        };

        let stripped = rule.matcher.strip(request.uri().path());
        *request.uri_mut() = with_path(request.uri(), &stripped);

        match &rule.target {
            RouteTarget::Proxy(proxy) => proxy.handle(request).await,
            RouteTarget::Static(files) => files.handle(request).await,
        }
    }
}
