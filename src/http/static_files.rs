//! Static file serving for virtual hosts and routes with a `root_dir`.

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use std::path::PathBuf;
use tower::ServiceExt;
use tower_http::services::ServeDir;

/// Serves files under a root directory; `/` maps to `index.html`.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    service: ServeDir,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if !root.is_dir() {
            // Requests will 404 until the directory appears.
            tracing::warn!(root = %root.display(), "Static root is not a directory");
        }
        Self {
            service: ServeDir::new(root),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match self.service.clone().oneshot(request).await {
            Ok(response) => response.map(Body::new),
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn serves_files_and_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::write(dir.path().join("app.css"), "body{}").unwrap();
        let files = StaticFiles::new(dir.path());

        let response = files
            .handle(Request::get("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"<h1>home</h1>");

        let response = files
            .handle(Request::get("/app.css").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = files
            .handle(Request::get("/missing.txt").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
