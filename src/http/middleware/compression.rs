//! Response compression predicate.

use axum::http::{header::CONTENT_TYPE, Response};
use tower_http::compression::predicate::{DefaultPredicate, Predicate};

/// Compress only textual bodies: `text/*` or anything JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextualContent;

impl Predicate for TextualContent {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: hyper::body::Body,
    {
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(is_textual)
    }
}

/// tower-http's defaults (no tiny bodies, images, gRPC or event streams)
/// narrowed to textual content.
pub fn compress_predicate() -> impl Predicate {
    DefaultPredicate::new().and(TextualContent)
}

pub fn is_textual(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    content_type.starts_with("text/") || content_type.contains("json")
}
