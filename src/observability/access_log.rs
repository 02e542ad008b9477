//! Per-request access log.
//!
//! One structured event per completed request under the `access_log`
//! target, so it can be filtered or routed separately from diagnostics.

use axum::{
    extract::Request,
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::http::request::{peer_addr, request_host, X_REQUEST_ID};
use crate::observability::metrics;

/// Headers checked after `Forwarded`, in trust order.
const CLIENT_IP_HEADERS: [&str; 5] = [
    "x-forwarded-for",
    "cf-connecting-ip",
    "fastly-client-ip",
    "true-client-ip",
    "x-real-ip",
];

/// Originating client address.
///
/// `Forwarded` (RFC 7239 `for=`) wins when it names a valid address. After
/// that the CDN and proxy headers are scanned in trust order,
/// taking the first entry that parses and is not private, loopback,
/// unspecified or link-local. The socket peer is the fallback.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(header::FORWARDED)
        .and_then(|v| v.to_str().ok())
        .and_then(forwarded_for);
    if let Some(ip) = forwarded {
        return display_ip(ip);
    }

    let relayed = CLIENT_IP_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .flat_map(|value| value.split(','))
        .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
        .find(|ip| !is_internal(ip));
    if let Some(ip) = relayed {
        return display_ip(ip);
    }

    peer.map(|addr| display_ip(addr.ip()))
        .unwrap_or_else(|| "-".to_string())
}

/// First `for=` node of a `Forwarded` value, if it is an address.
fn forwarded_for(value: &str) -> Option<IpAddr> {
    let node = value
        .split([';', ','])
        .map(str::trim)
        .find_map(|pair| {
            let (key, node) = pair.split_once('=')?;
            key.trim().eq_ignore_ascii_case("for").then_some(node)
        })?
        .trim()
        .trim_matches('"');

    if let Ok(addr) = node.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    node.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

fn is_internal(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_link_local()
                || v4.octets()[..3] == [224, 0, 0]
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_internal(&IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || first & 0xfe00 == 0xfc00
                || first & 0xffc0 == 0xfe80
                || first == 0xff02
        }
    }
}

/// Mapped IPv4 prints as IPv4 and `::1` as `127.0.0.1`.
fn display_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None if v6.is_loopback() => "127.0.0.1".to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Middleware emitting the access log record and request metrics.
pub async fn access_log(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let headers = request.headers();
    let host = request_host(headers, request.uri())
        .unwrap_or_default()
        .to_string();
    let client = client_ip(headers, peer_addr(request.extensions()));
    let user_agent = header_str(headers, header::USER_AGENT);
    let referer = header_str(headers, header::REFERER);
    let request_id = header_str(headers, X_REQUEST_ID);

    let response = next.run(request).await;

    let status = response.status().as_u16();
    tracing::info!(
        target: "access_log",
        client_ip = %client,
        method = %method,
        host = %host,
        path = %path,
        query = %query,
        status,
        latency_ms = start.elapsed().as_secs_f64() * 1000.0,
        user_agent = %user_agent,
        referer = %referer,
        request_id = %request_id,
    );
    metrics::record_request(&host, status, start);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_ip_prefers_forwarded_headers() {
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer)), "192.0.2.1");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_ip(&headers, Some(peer)), "198.51.100.7");

        headers.insert("true-client-ip", HeaderValue::from_static("198.51.100.8"));
        assert_eq!(client_ip(&headers, Some(peer)), "198.51.100.8");

        headers.insert("cf-connecting-ip", HeaderValue::from_static("198.51.100.9"));
        assert_eq!(client_ip(&headers, Some(peer)), "198.51.100.9");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.5");

        headers.insert(
            "forwarded",
            HeaderValue::from_static("for=\"[2001:db8::17]:4711\";proto=https"),
        );
        assert_eq!(client_ip(&headers, Some(peer)), "2001:db8::17");

        assert_eq!(client_ip(&HeaderMap::new(), None), "-");
    }

    #[test]
    fn internal_and_malformed_entries_are_skipped() {
        let peer: SocketAddr = "[::1]:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("unknown, 10.1.2.3, 127.0.0.1, 169.254.0.9, fd00::1, 203.0.113.20"),
        );
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.20");

        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.10"));
        headers.insert("x-real-ip", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers, Some(peer)), "127.0.0.1");

        headers.insert("forwarded", HeaderValue::from_static("for=_hidden;by=203.0.113.1"));
        headers.insert("fastly-client-ip", HeaderValue::from_static("::ffff:198.51.100.4"));
        assert_eq!(client_ip(&headers, Some(peer)), "198.51.100.4");
    }
}
