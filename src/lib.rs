//! Multi-tenant edge proxy library.
//!
//! Listeners serve many virtual hosts each; a host is backed by a single
//! upstream, a static directory, a health-checked backend pool, or a
//! path-prefix router.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;

// Traffic management
pub mod health;
pub mod load_balancer;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::ProxyConfig;
pub use lifecycle::{EdgeServerSet, Shutdown, StartError};
