//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Per-backend timer
//!     → GET <backend><health_path>
//!     → 200 within the probe timeout = alive, anything else = dead
//!     → BackendStatus::set_alive
//!
//! Failover (load_balancer::balancer):
//!     Transport error
//!     → BackendStatus::mark_dead
//! ```
//!
//! # Design Decisions
//! - One task per backend, so a slow probe never delays another backend
//! - Only the active checker revives a backend
//! - Health state is per-backend, not per-pool

pub mod active;

pub use active::{HealthChecker, PROBE_TIMEOUT};
