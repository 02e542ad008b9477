//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path, headers)
//!     → router.rs (virtual host lookup by normalized Host)
//!     → HostHandler: proxy | static | balanced | routed
//!     → path_router.rs (routed hosts: first matching prefix, stripped)
//!     → matcher.rs (host normalization, prefix match)
//! ```
//!
//! # Design Decisions
//! - Handlers built at startup, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route
//! - First match wins (declaration order)

pub mod matcher;
pub mod path_router;
pub mod router;

pub use path_router::{PathRouter, RouteRule, RouteTarget};
pub use router::{HandlerContext, HostHandler, RegistryError, VirtualHostRegistry};
