//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Exactly one backend strategy per virtual host
//! - Hostnames unique across every listener
//! - Upstream URLs and listen addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Missing TLS files are not checked here; the listener fails fast on them at bind

use std::collections::HashSet;
use thiserror::Error;
use url::Url;

use crate::config::schema::{parse_listen_address, ListenerConfig, ProxyConfig, VirtualHostConfig};
use crate::routing::matcher::normalize_host;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener '{address}': malformed listen address")]
    InvalidListenAddress { address: String },

    #[error("listener '{address}' is declared more than once")]
    DuplicateListenAddress { address: String },

    #[error("listener '{address}': TLS enabled without cert_file and key_file")]
    IncompleteTls { address: String },

    #[error("virtual host with empty hostname on listener '{address}'")]
    EmptyHostname { address: String },

    #[error("virtual host '{hostname}' has no backend strategy (proxy, root_dir, backends or routes)")]
    NoStrategy { hostname: String },

    #[error("virtual host '{hostname}' has {count} backend strategies, expected exactly one")]
    MultipleStrategies { hostname: String, count: usize },

    #[error("hostname '{hostname}' is configured more than once")]
    DuplicateHostname { hostname: String },

    #[error("virtual host '{hostname}': invalid upstream url '{url}'")]
    InvalidUpstream { hostname: String, url: String },

    #[error("virtual host '{hostname}': route with empty path")]
    EmptyRoutePath { hostname: String },

    #[error("virtual host '{hostname}': route '{path}' needs exactly one of proxy or root_dir")]
    InvalidRouteTarget { hostname: String, path: String },
}

/// Validate a parsed configuration, collecting every violation.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut addresses = HashSet::new();
    let mut hostnames = HashSet::new();

    for listener in &config.listeners {
        validate_listener(listener, &mut addresses, &mut errors);

        for vhost in &listener.virtual_hosts {
            // Compared the way the registry matches them: no port, no
            // trailing dot, case-folded.
            let hostname = normalize_host(&vhost.hostname);
            if hostname.is_empty() {
                errors.push(ValidationError::EmptyHostname {
                    address: listener.listen_address.clone(),
                });
            } else if !hostnames.insert(hostname) {
                errors.push(ValidationError::DuplicateHostname {
                    hostname: vhost.hostname.clone(),
                });
            }
            validate_virtual_host(vhost, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(
    listener: &ListenerConfig,
    addresses: &mut HashSet<std::net::SocketAddr>,
    errors: &mut Vec<ValidationError>,
) {
    match parse_listen_address(&listener.listen_address) {
        Ok(addr) => {
            // Port 0 asks the OS for a fresh port each time, so it never collides.
            if addr.port() != 0 && !addresses.insert(addr) {
                errors.push(ValidationError::DuplicateListenAddress {
                    address: listener.listen_address.clone(),
                });
            }
        }
        Err(_) => errors.push(ValidationError::InvalidListenAddress {
            address: listener.listen_address.clone(),
        }),
    }

    if let Some(tls) = listener.active_tls() {
        if tls.cert_file.is_empty() || tls.key_file.is_empty() {
            errors.push(ValidationError::IncompleteTls {
                address: listener.listen_address.clone(),
            });
        }
    }
}

fn validate_virtual_host(vhost: &VirtualHostConfig, errors: &mut Vec<ValidationError>) {
    match vhost.strategy_count() {
        0 => errors.push(ValidationError::NoStrategy {
            hostname: vhost.hostname.clone(),
        }),
        1 => {}
        count => errors.push(ValidationError::MultipleStrategies {
            hostname: vhost.hostname.clone(),
            count,
        }),
    }

    let upstreams = vhost
        .proxy
        .iter()
        .chain(vhost.backends.iter())
        .chain(vhost.routes.iter().filter_map(|r| r.proxy.as_ref()));
    for url in upstreams {
        if !is_valid_upstream(url) {
            errors.push(ValidationError::InvalidUpstream {
                hostname: vhost.hostname.clone(),
                url: url.clone(),
            });
        }
    }

    for route in &vhost.routes {
        if route.path.is_empty() {
            errors.push(ValidationError::EmptyRoutePath {
                hostname: vhost.hostname.clone(),
            });
        }
        let has_proxy = route.proxy.as_deref().is_some_and(|p| !p.is_empty());
        let has_root = route.root_dir.as_deref().is_some_and(|r| !r.is_empty());
        if has_proxy == has_root {
            errors.push(ValidationError::InvalidRouteTarget {
                hostname: vhost.hostname.clone(),
                path: route.path.clone(),
            });
        }
    }
}

/// An upstream must be an absolute http(s) URL with a host.
pub fn is_valid_upstream(raw: &str) -> bool {
    Url::parse(raw)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}
