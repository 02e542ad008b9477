//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (accept loop, HTTP/1.1 + h2, drain)
//!     → middleware/ (request id, limits, headers, access log, gzip)
//!     → routing (virtual host → handler)
//!     → proxy.rs / static_files.rs (forward or serve)
//!     → client.rs (pooled upstream connections)
//!     → response.rs (proxy-originated errors)
//!     → Send to client
//! ```

pub mod client;
pub mod middleware;
pub mod proxy;
pub mod request;
pub mod response;
pub mod server;
pub mod static_files;

pub use client::UpstreamClient;
pub use proxy::{ReverseProxy, UpstreamError};
pub use request::X_REQUEST_ID;
pub use server::{EdgeListener, ListenerState, StartupError};
