//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request for a balanced virtual host
//!     → balancer.rs (buffer body, failover loop)
//!     → Selector::pick (round_robin.rs / random.rs)
//!     → backend.rs (liveness check)
//!     → http::proxy (forward)
//!     → on transport error: mark backend dead, pick again
//! ```
//!
//! # Design Decisions
//! - Selection policy is a trait object chosen from config
//! - At most 2×N attempts per request, then 503
//! - Health checks revive backends; the balancer only ever marks them dead

pub mod backend;
pub mod balancer;
pub mod random;
pub mod round_robin;

pub use backend::BackendStatus;
pub use balancer::LoadBalancer;
pub use random::Random;
pub use round_robin::RoundRobin;

use crate::config::LbPolicy;

/// Chooses a backend index for the next attempt.
pub trait Selector: Send + Sync + std::fmt::Debug {
    /// Return an index in `0..count`. `count` is never zero.
    fn pick(&self, count: usize) -> usize;
}

/// Build the selector for a configured policy.
pub fn selector_for(policy: LbPolicy) -> Box<dyn Selector> {
    match policy {
        LbPolicy::RoundRobin => Box::new(RoundRobin::new()),
        LbPolicy::Random => Box::new(Random),
    }
}
