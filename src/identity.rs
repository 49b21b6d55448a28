//! Caller identification from proxy address headers.
//!
//! Every header here is client-controllable unless a proxy in front of the
//! service overwrites it, so values are validated as address literals and
//! anything else is ignored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// Identifier shared by every caller whose address could not be determined.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Default header trust order, most specific proxy-injected header first.
pub const DEFAULT_HEADER_ORDER: [&str; 5] = [
    "cf-connecting-ip",
    "true-client-ip",
    "x-real-ip",
    "x-client-ip",
    "x-forwarded-for",
];

/// A header that may have been sent once or several times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    /// The first occurrence of the header.
    pub fn first(&self) -> Option<&str> {
        match self {
            HeaderValue::Single(v) => Some(v.as_str()),
            HeaderValue::Multi(values) => values.first().map(String::as_str),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Single(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Single(v)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(v: Vec<String>) -> Self {
        HeaderValue::Multi(v)
    }
}

impl From<Vec<&str>> for HeaderValue {
    fn from(v: Vec<&str>) -> Self {
        HeaderValue::Multi(v.into_iter().map(str::to_string).collect())
    }
}

/// Request headers keyed case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "HashMap<String, HeaderValue>")]
pub struct RequestHeaders(HashMap<String, HeaderValue>);

impl RequestHeaders {
    /// Create an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value.
    pub fn insert(&mut self, name: &str, value: impl Into<HeaderValue>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Look up a header by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.get(&name.to_ascii_lowercase())
    }

    /// Whether no headers were supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, HeaderValue>> for RequestHeaders {
    fn from(map: HashMap<String, HeaderValue>) -> Self {
        map.into_iter().collect()
    }
}

impl<K: AsRef<str>, V: Into<HeaderValue>> FromIterator<(K, V)> for RequestHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = RequestHeaders::new();
        for (name, value) in iter {
            headers.insert(name.as_ref(), value);
        }
        headers
    }
}

/// Header trust order for identifier resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverSettings {
    #[serde(default = "default_header_order")]
    pub header_order: Vec<String>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            header_order: default_header_order(),
        }
    }
}

fn default_header_order() -> Vec<String> {
    DEFAULT_HEADER_ORDER.iter().map(|h| h.to_string()).collect()
}

/// Derives a stable caller identifier from proxy address headers.
#[derive(Debug, Clone)]
pub struct ClientIdentifierResolver {
    header_order: Vec<String>,
}

impl Default for ClientIdentifierResolver {
    fn default() -> Self {
        Self::new(&ResolverSettings::default())
    }
}

impl ClientIdentifierResolver {
    /// Create a resolver with the given header order.
    pub fn new(settings: &ResolverSettings) -> Self {
        Self {
            header_order: settings
                .header_order
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// The headers consulted, in order.
    pub fn header_order(&self) -> &[String] {
        &self.header_order
    }

    /// Resolve the caller identifier, or [`UNKNOWN_IDENTIFIER`] if no header
    /// carries a valid address.
    pub fn resolve(&self, headers: &RequestHeaders) -> String {
        match self.resolve_ip(headers) {
            Some(ip) => ip.to_string(),
            None => {
                debug!(
                    headers_present = !headers.is_empty(),
                    "No valid client address in headers, using shared identifier"
                );
                UNKNOWN_IDENTIFIER.to_string()
            }
        }
    }

    /// The first valid address found in trust order.
    pub fn resolve_ip(&self, headers: &RequestHeaders) -> Option<IpAddr> {
        self.header_order.iter().find_map(|name| {
            let value = headers.get(name)?.first()?;
            let candidate = value.split(',').next()?;
            let ip = parse_address(candidate);
            if ip.is_none() {
                debug!(header = %name, "Ignoring malformed address header");
            }
            ip
        })
    }
}

/// Parse a bare IP literal or a socket address, normalizing IPv4-mapped
/// IPv6 addresses to IPv4.
fn parse_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<IpAddr>()
        .or_else(|_| raw.parse::<SocketAddr>().map(|addr| addr.ip()))
        .ok()
        .map(|ip| ip.to_canonical())
}
