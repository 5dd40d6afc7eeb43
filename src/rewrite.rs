//! Request and response rewriting
//!
//! The Director turns a client-facing request into the one sent upstream;
//! the header helpers strip hop-by-hop fields on both legs and keep
//! `Location` redirects pointing at the proxy instead of the backend.

use crate::error::ProxyError;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, LOCATION, UPGRADE, USER_AGENT};
use hyper::http::request;
use hyper::Uri;
use std::net::IpAddr;
use url::{Position, Url};

/// Diagnostic header carrying the upstream `Location` before rewriting
pub const ORIGIN_LOCATION_HEADER: &str = "zr-origin-location";

/// Carrier for an upgrade intent that must survive hop-by-hop stripping
pub const UPGRADE_CARRIER_HEADER: &str = "a-upgrade";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Hop-by-hop headers removed at every proxy boundary, in addition to the
/// ones listed in `Connection`.
const HOP_HEADERS: &[&str] = &[
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Per-request response rewrite parameters
#[derive(Debug, Clone, Default)]
pub struct ResponseRewriteRuleSet {
    /// Upstream host:port
    pub proxy_domain: String,
    /// Host header the client used to reach the proxy
    pub original_host: String,
    /// Whether the upstream connection itself is TLS
    pub use_tls: bool,
    /// Virtual directory this route is mounted under
    pub path_prefix: String,
}

/// Rewrites outbound requests onto one upstream target
#[derive(Debug, Clone)]
pub struct Director {
    scheme: String,
    authority: String,
    path: String,
    query: String,
}

impl Director {
    pub fn new(target: &Url) -> Result<Self, ProxyError> {
        let host = target
            .host_str()
            .ok_or_else(|| ProxyError::InvalidUpstream(format!("{} has no host", target)))?;

        let authority = match target.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            scheme: target.scheme().to_string(),
            authority,
            path: target.path().to_string(),
            query: target.query().unwrap_or("").to_string(),
        })
    }

    /// Upstream host[:port]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// Point the request at the upstream: scheme and authority replaced,
    /// paths joined with a single slash, query strings concatenated.
    pub fn direct(&self, parts: &mut request::Parts) -> Result<(), ProxyError> {
        let path = single_joining_slash(&self.path, parts.uri.path());
        let req_query = parts.uri.query().unwrap_or("");

        let query = if self.query.is_empty() || req_query.is_empty() {
            format!("{}{}", self.query, req_query)
        } else {
            format!("{}&{}", self.query, req_query)
        };

        let path_and_query = if query.is_empty() {
            path
        } else {
            format!("{}?{}", path, query)
        };

        parts.uri = Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(self.authority.as_str())
            .path_and_query(path_and_query)
            .build()?;

        // An empty User-Agent keeps the client from adding its own
        if !parts.headers.contains_key(USER_AGENT) {
            parts.headers.insert(USER_AGENT, HeaderValue::from_static(""));
        }

        Ok(())
    }
}

/// Join two URL paths so exactly one slash sits at the seam
pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Remove hop-by-hop headers, including every header named in
/// `Connection`, then promote `A-Upgrade` to `Upgrade`.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .filter_map(|f| HeaderName::from_bytes(f.as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    for name in HOP_HEADERS {
        headers.remove(*name);
    }

    if let Some(carried) = headers.remove(UPGRADE_CARRIER_HEADER) {
        headers.insert(UPGRADE, carried);
    }
}

/// Append the client address to `X-Forwarded-For` and set
/// `X-Forwarded-Proto` from the inbound connection.
pub fn add_x_forwarded_headers(headers: &mut HeaderMap, client_ip: IpAddr, inbound_tls: bool) {
    let client_ip = client_ip.to_string();
    let prior: Vec<&[u8]> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .map(|v| v.as_bytes())
        .collect();

    let forwarded = if prior.is_empty() {
        HeaderValue::from_str(&client_ip).ok()
    } else {
        let mut joined = prior.join(&b", "[..]);
        joined.extend_from_slice(b", ");
        joined.extend_from_slice(client_ip.as_bytes());
        HeaderValue::from_bytes(&joined).ok()
    };

    if let Some(value) = forwarded {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let proto = if inbound_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

/// Set the Host the upstream sees. Plain upstreams keep the virtual host
/// the client asked for; TLS upstreams get their own authority.
pub fn apply_host(headers: &mut HeaderMap, rules: &ResponseRewriteRuleSet) {
    if rules.use_tls {
        headers.remove(HOST);
        return;
    }

    match HeaderValue::from_str(&rules.original_host) {
        Ok(host) if !rules.original_host.is_empty() => {
            headers.insert(HOST, host);
        }
        _ => {
            headers.remove(HOST);
        }
    }
}

/// Declared trailer names from a `Trailer` header, read before stripping
pub fn declared_trailers(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(hyper::header::TRAILER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter_map(|f| HeaderName::from_bytes(f.as_bytes()).ok())
        .collect()
}

/// Rewrite an upstream `Location` header so the client stays on the proxy.
///
/// Absolute URLs get the proxy's scheme and host; root-relative paths get
/// the mount prefix; anything else is already relative to the current page.
pub fn rewrite_location(headers: &mut HeaderMap, rules: &ResponseRewriteRuleSet, inbound_tls: bool) {
    let original = match headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
        Some(loc) if !loc.is_empty() => loc.to_string(),
        _ => return,
    };

    if let Ok(value) = HeaderValue::from_str(&original) {
        headers.insert(ORIGIN_LOCATION_HEADER, value);
    }

    let rewritten = if original.starts_with("http://") || original.starts_with("https://") {
        replace_location_host(&original, rules, inbound_tls).unwrap_or_else(|| original.clone())
    } else if original.starts_with('/') && !rules.path_prefix.is_empty() {
        format!("{}{}", rules.path_prefix.trim_end_matches('/'), original)
    } else {
        original.clone()
    };

    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(LOCATION, value);
    }
}

fn replace_location_host(location: &str, rules: &ResponseRewriteRuleSet, inbound_tls: bool) -> Option<String> {
    if rules.original_host.is_empty() {
        return None;
    }

    let url = Url::parse(location).ok()?;
    let scheme = if inbound_tls { "https" } else { "http" };

    Some(format!(
        "{}://{}{}",
        scheme,
        rules.original_host,
        &url[Position::BeforePath..]
    ))
}
