//! Per-client rate limiting middleware.
//!
//! # Responsibilities
//! - Keep one token bucket per client IP
//! - Reject with 429 when a client's bucket is empty
//! - Bound the number of tracked clients
//!
//! # Design Decisions
//! - Clients are keyed by the TCP peer IP, never by forwarded headers
//! - A refill rate of zero is allowed: the burst is then a lifetime budget
//! - When the table is full, idle clients are evicted first, then the
//!   least recently seen one

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::http::request::peer_addr;
use crate::http::response;
use crate::observability::metrics;

/// A simple token bucket rate limiter.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_update: now,
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();

        // Refill tokens
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Shared limiter state; one per process.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<IpAddr, TokenBucket>,
    rate: f64,
    burst: f64,
    max_clients: usize,
    idle_ttl: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            rate: config.requests_per_second as f64,
            burst: config.burst_size as f64,
            max_clients: config.max_clients.max(1),
            idle_ttl: Duration::from_secs(config.client_idle_secs),
        }
    }

    /// Take a token for `client`. Returns false when the request must be rejected.
    pub fn check(&self, client: IpAddr) -> bool {
        self.check_at(client, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock.
    pub fn check_at(&self, client: IpAddr, now: Instant) -> bool {
        if !self.buckets.contains_key(&client) && self.buckets.len() >= self.max_clients {
            self.evict(now);
        }
        let mut bucket = self
            .buckets
            .entry(client)
            .or_insert_with(|| TokenBucket::new(self.burst, now));
        bucket.try_acquire(self.burst, self.rate, now)
    }

    fn evict(&self, now: Instant) {
        let ttl = self.idle_ttl;
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_update) < ttl);

        if self.buckets.len() >= self.max_clients {
            let oldest = self
                .buckets
                .iter()
                .min_by_key(|entry| entry.value().last_update)
                .map(|entry| *entry.key());
            if let Some(ip) = oldest {
                self.buckets.remove(&ip);
            }
        }
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}

/// Middleware function for per-IP rate limiting.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = peer_addr(request.extensions())
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if limiter.check(client) {
        next.run(request).await
    } else {
        tracing::warn!(client = %client, path = %request.uri().path(), "Rate limit exceeded");
        metrics::record_rate_limited();
        response::too_many_requests()
    }
}
