//! Round-robin selection policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use crate::load_balancer::Selector;

/// Round-robin selector.
/// Stores an internal counter to rotate through backends.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for RoundRobin {
    fn pick(&self, count: usize) -> usize {
        // Concurrent callers interleave freely; the counter only guarantees
        // a fair cycle over time.
        self.counter.fetch_add(1, Ordering::Relaxed) % count
    }
}
