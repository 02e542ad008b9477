//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the edge server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default health check path probed on every backend.
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Default health check period in seconds.
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 15;

/// Root configuration for the edge server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// One entry per bound socket.
    pub listeners: Vec<ListenerConfig>,

    /// Inbound connection timeouts and the drain window.
    pub timeouts: TimeoutConfig,

    /// Shared outbound transport tunables.
    pub upstream: UpstreamConfig,

    /// Connection tracker tuning.
    pub connections: ConnectionConfig,

    /// Per-client rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Security headers and request size limits.
    pub security: SecurityConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Listener configuration: one physical socket and the virtual hosts behind it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listen address (e.g. "0.0.0.0:8080" or ":443").
    pub listen_address: String,

    /// Optional TLS termination.
    pub tls: Option<TlsConfig>,

    /// Virtual hosts served on this socket, in declaration order.
    pub virtual_hosts: Vec<VirtualHostConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            tls: None,
            virtual_hosts: Vec::new(),
        }
    }
}

impl ListenerConfig {
    /// TLS settings, only when present and enabled.
    pub fn active_tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref().filter(|tls| tls.enabled)
    }
}

/// Parse a listen address, accepting the `:port` shorthand for all interfaces.
pub fn parse_listen_address(address: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    if let Some(port) = address.strip_prefix(':') {
        return format!("0.0.0.0:{}", port).parse();
    }
    address.parse()
}

/// Minimum negotiated TLS protocol version.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "TLS12")]
    Tls12,
    #[serde(rename = "TLS13")]
    Tls13,
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS termination is on.
    pub enabled: bool,

    /// Path to certificate chain (PEM).
    pub cert_file: String,

    /// Path to private key (PEM).
    pub key_file: String,

    /// Lowest protocol version accepted.
    pub min_version: TlsVersion,

    /// Restrict to the AEAD + forward secrecy allow-list.
    pub strict_ciphers: bool,

    /// HSTS max-age in seconds; 0 disables the header.
    pub hsts_max_age: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: String::new(),
            key_file: String::new(),
            min_version: TlsVersion::Tls12,
            strict_ciphers: true,
            hsts_max_age: 63_072_000,
        }
    }
}

/// Load balancing policy for a multi-backend virtual host.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    Random,
}

/// One virtual host: a hostname bound to exactly one backend strategy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VirtualHostConfig {
    /// Exact hostname (port is never part of it).
    pub hostname: String,

    /// Single upstream target URL.
    pub proxy: Option<String>,

    /// Static file root.
    pub root_dir: Option<String>,

    /// Load-balanced upstream target URLs.
    pub backends: Vec<String>,

    /// Selection policy for `backends`.
    pub lb_policy: LbPolicy,

    /// Path-prefix routing table, evaluated in order.
    pub routes: Vec<RouteConfig>,

    /// Health check path for `backends`.
    pub health_path: String,

    /// Health check period in seconds for `backends`.
    pub health_interval_secs: u64,
}

impl Default for VirtualHostConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            proxy: None,
            root_dir: None,
            backends: Vec::new(),
            lb_policy: LbPolicy::RoundRobin,
            routes: Vec::new(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            health_interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
        }
    }
}

impl VirtualHostConfig {
    /// Number of backend strategies populated. Valid configs have exactly one.
    pub fn strategy_count(&self) -> usize {
        [
            self.proxy.as_deref().is_some_and(|p| !p.is_empty()),
            self.root_dir.as_deref().is_some_and(|r| !r.is_empty()),
            !self.backends.is_empty(),
            !self.routes.is_empty(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    /// Health path with the default applied.
    pub fn effective_health_path(&self) -> &str {
        if self.health_path.is_empty() {
            DEFAULT_HEALTH_PATH
        } else {
            &self.health_path
        }
    }

    /// Health interval with the default applied.
    pub fn effective_health_interval(&self) -> Duration {
        let secs = if self.health_interval_secs == 0 {
            DEFAULT_HEALTH_INTERVAL_SECS
        } else {
            self.health_interval_secs
        };
        Duration::from_secs(secs)
    }
}

/// One path-router rule.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouteConfig {
    /// Path prefix (e.g. "/api/").
    pub path: String,

    /// Upstream target URL.
    pub proxy: Option<String>,

    /// Static file root.
    pub root_dir: Option<String>,
}

/// Inbound timeouts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to read request headers.
    pub read_header_secs: u64,

    /// How long a response write may stall on a peer that stopped reading.
    pub write_secs: u64,

    /// Keep-alive idle time before the sweep closes a connection.
    pub idle_secs: u64,

    /// Drain window on shutdown before remaining connections are force-closed.
    pub shutdown_secs: u64,

    /// Inbound TLS handshake bound.
    pub tls_handshake_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_header_secs: 10,
            write_secs: 30,
            idle_secs: 120,
            shutdown_secs: 30,
            tls_handshake_secs: 10,
        }
    }
}

/// Shared outbound transport tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Pooled connections kept for reuse across all upstream hosts. Beyond
    /// this, new connections serve one exchange and are closed.
    pub max_idle: usize,

    /// Idle pooled connections kept per upstream host.
    pub max_idle_per_host: usize,

    /// Idle pooled connection lifetime.
    pub idle_timeout_secs: u64,

    /// TCP connect bound.
    pub connect_timeout_secs: u64,

    /// TLS handshake bound for https upstreams.
    pub tls_handshake_timeout_secs: u64,

    /// Time allowed for the upstream to produce response headers.
    pub response_header_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_idle: 1000,
            max_idle_per_host: 100,
            idle_timeout_secs: 90,
            connect_timeout_secs: 5,
            tls_handshake_timeout_secs: 10,
            response_header_timeout_secs: 30,
        }
    }
}

/// Connection tracker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum concurrent connections per listener (backpressure).
    pub max_connections: usize,

    /// Maximum idle keep-alive connections per listener.
    pub max_idle: usize,

    /// Period of the idle sweep.
    pub sweep_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_idle: 1_000,
            sweep_interval_secs: 60,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Refill rate per client IP.
    pub requests_per_second: u32,

    /// Burst capacity.
    pub burst_size: u32,

    /// Upper bound on tracked clients.
    pub max_clients: usize,

    /// Buckets untouched for this long may be evicted.
    pub client_idle_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100,
            burst_size: 200,
            max_clients: 10_000,
            client_idle_secs: 300,
        }
    }
}

/// Security hardening configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Enable security headers.
    pub enable_headers: bool,
    /// Maximum buffered body size in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_headers: true,
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
