//! Request handling and transformation.
//!
//! # Responsibilities
//! - Generate unique request ID (UUID v4)
//! - Extract routing-relevant information (host, peer, scheme)
//! - Prepare request for forwarding to backend
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - The inbound Host header is preserved on the upstream request
//! - Hop-by-hop headers never cross the proxy, except the `Connection` and
//!   `Upgrade` pair of a protocol switch

use axum::extract::ConnectInfo;
use axum::http::header::{CONNECTION, HOST, UPGRADE};
use axum::http::request::Parts;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{Extensions, HeaderMap, HeaderName, HeaderValue, Request, Uri, Version};
use std::net::SocketAddr;
use tower_http::request_id::{MakeRequestId, RequestId};
use url::Url;
use uuid::Uuid;

/// Header carrying the request correlation ID.
pub const X_REQUEST_ID: &str = "x-request-id";

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers meaningful only for a single transport hop.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Generates a UUID v4 request ID when the client did not send one.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Marker extension for requests that arrived over TLS.
#[derive(Debug, Clone, Copy)]
pub struct TlsConnection;

/// Peer address inserted by the listener.
pub fn peer_addr(extensions: &Extensions) -> Option<SocketAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Host the client addressed: the Host header, else the URI authority
/// (HTTP/2 sends `:authority` instead of Host).
pub fn request_host<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<&'a str> {
    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.authority().map(Authority::as_str))
}

/// Replace the path of a URI, keeping its query and authority.
pub fn with_path(uri: &Uri, path: &str) -> Uri {
    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    match PathAndQuery::try_from(path_and_query) {
        Ok(pq) => parts.path_and_query = Some(pq),
        Err(_) => return uri.clone(),
    }
    Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
}

/// Join two URL paths with exactly one slash between them.
pub fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Protocol named by `Upgrade` when `Connection` carries the `upgrade` token.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let switching = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if switching {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// [`strip_hop_by_hop`], then restore an upgrade handshake if there was one.
pub fn strip_hop_by_hop_keep_upgrade(headers: &mut HeaderMap) {
    let protocol = upgrade_protocol(headers);
    strip_hop_by_hop(headers);
    if let Some(protocol) = protocol {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, protocol);
    }
}

/// Scheme, authority and base path of an upstream.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
}

impl UpstreamTarget {
    /// Split an absolute http(s) URL into its forwarding parts.
    pub fn from_url(url: &Url) -> Option<Self> {
        let scheme = match url.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            _ => return None,
        };
        url.host_str()?;
        let authority = Authority::try_from(&url[url::Position::BeforeHost..url::Position::AfterPort]).ok()?;
        Some(Self {
            scheme,
            authority,
            base_path: url.path().to_string(),
            base_query: url.query().map(str::to_owned),
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Upstream URI for an inbound path and query.
    pub fn uri_for(&self, path: &str, query: Option<&str>) -> Result<Uri, axum::http::Error> {
        let path = join_paths(&self.base_path, path);
        let query = match (self.base_query.as_deref(), query) {
            (Some(base), Some(extra)) if !base.is_empty() && !extra.is_empty() => {
                Some(format!("{}&{}", base, extra))
            }
            (Some(base), _) if !base.is_empty() => Some(base.to_string()),
            (_, Some(extra)) if !extra.is_empty() => Some(extra.to_string()),
            _ => None,
        };
        let path_and_query = match query {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}

/// Build the request sent upstream from the inbound request parts.
///
/// The path is taken from `parts.uri`, so callers that strip a route prefix
/// rewrite the URI first.
pub fn upstream_request<B>(
    parts: &Parts,
    target: &UpstreamTarget,
    body: B,
) -> Result<Request<B>, axum::http::Error> {
    let uri = target.uri_for(parts.uri.path(), parts.uri.query())?;

    let mut headers = parts.headers.clone();
    strip_hop_by_hop_keep_upgrade(&mut headers);

    let inbound_host = request_host(&parts.headers, &parts.uri).map(str::to_owned);
    if !headers.contains_key(HOST) {
        if let Some(value) = inbound_host.as_deref().and_then(|h| HeaderValue::from_str(h).ok()) {
            headers.insert(HOST, value);
        }
    }

    if let Some(peer) = peer_addr(&parts.extensions) {
        let client = peer.ip().to_string();
        let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, client),
            None => client,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
    }

    let proto = if parts.extensions.get::<TlsConnection>().is_some() {
        "https"
    } else {
        "http"
    };
    headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static(proto));

    if let Some(value) = inbound_host.and_then(|h| HeaderValue::from_str(&h).ok()) {
        headers.insert(X_FORWARDED_HOST.clone(), value);
    }

    let mut request = Request::new(body);
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;
    Ok(request)
}
