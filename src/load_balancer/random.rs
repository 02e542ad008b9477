//! Uniform random selection policy.

use crate::load_balancer::Selector;

/// Picks a uniformly random backend per request.
#[derive(Debug, Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for Random {
    fn pick(&self, count: usize) -> usize {
        fastrand::usize(..count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_in_range_and_covers_all() {
        let lb = Random::new();
        let mut seen = [false; 4];
        for _ in 0..2000 {
            let idx = lb.pick(4);
            assert!(idx < 4);
            seen[idx] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
