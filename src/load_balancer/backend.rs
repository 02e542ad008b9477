//! Backend liveness record.
//!
//! # Responsibilities
//! - Represent a single upstream target
//! - Hold the alive flag behind its own read/write lock
//!
//! # Design Decisions
//! - `alive` is the only shared mutable state of a backend
//! - Readers (selection) take the read lock, writers (health checker,
//!   failover handler) take the write lock
//! - Starts alive; only the health checker brings a dead backend back

use std::sync::{PoisonError, RwLock};
use url::Url;

/// Liveness record for one upstream target.
#[derive(Debug)]
pub struct BackendStatus {
    target: Url,
    alive: RwLock<bool>,
}

impl BackendStatus {
    /// Create a backend record, initially alive.
    pub fn new(target: Url) -> Self {
        Self {
            target,
            alive: RwLock::new(true),
        }
    }

    /// The parsed upstream URL.
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Current believed liveness.
    pub fn is_alive(&self) -> bool {
        *self.alive.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set liveness. Returns the previous value so callers can log transitions.
    pub fn set_alive(&self, alive: bool) -> bool {
        let mut guard = self.alive.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, alive)
    }

    /// Mark the backend dead after a transport failure.
    pub fn mark_dead(&self) -> bool {
        self.set_alive(false)
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_alive_and_reports_transitions() {
        let backend = BackendStatus::new(Url::parse("http://127.0.0.1:8080").unwrap());
        assert!(backend.is_alive());

        assert!(backend.mark_dead());
        assert!(!backend.is_alive());
        assert!(!backend.mark_dead());

        assert!(!backend.set_alive(true));
        assert!(backend.is_alive());
    }
}
