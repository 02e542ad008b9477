//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Shared client + limiter → Bind every listener
//!     → any failure: release all, report every failure
//!     → all bound: spawn listeners, wait for Serving
//!
//! Shutdown (shutdown.rs):
//!     trigger → listeners stop accepting → drain → force-close → Closed
//!             → health checkers exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: forced close after the drain window

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{EdgeServerSet, ListenerFailure, ListenerHandle, StartError};
