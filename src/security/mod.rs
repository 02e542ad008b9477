//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (check per-IP limits, 429 on reject)
//!     → Pass to routing
//! Outgoing response:
//!     → headers.rs (hardening headers, no-store on POST)
//! ```
//!
//! # Design Decisions
//! - Defense in depth: multiple layers of protection
//! - No trust in client input (rate limit keys on the socket peer)

pub mod headers;
pub mod rate_limit;

pub use rate_limit::{rate_limit_middleware, RateLimiter};
