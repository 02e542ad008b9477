//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (active/idle tracking)
//!     → write_timeout.rs (stall deadline on outbound bytes)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     Active ⇄ Idle → Closed (or Hijacked)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod tls;
pub mod write_timeout;

pub use connection::{ConnectionId, ConnectionState, ConnectionTracker, TrackedConnection};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use tls::TlsError;
pub use write_timeout::WriteTimeout;
