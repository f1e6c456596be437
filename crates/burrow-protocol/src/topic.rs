use std::fmt;

use uuid::Uuid;

/// Namespace every client topic lives under
pub const TOPIC_NAMESPACE: &str = "clients/";

/// Header carrying the per-request correlation token in dumps and replies
pub const REQUEST_ID_HEADER: &str = "X-Burrow-Request-Id";

/// Identifier of a tunnel client, taken from the leading label of a host name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Derive the client identifier from a request host.
    ///
    /// Everything before the first `.` is the identifier. A host without any
    /// dot, or one whose leading label is empty, is used unmodified, so `bar`
    /// names the client `bar`. A trailing `:port` is ignored.
    pub fn from_host(host: &str) -> Self {
        let host = strip_port(host);
        let label = match host.split_once('.') {
            Some((first, _)) if !first.is_empty() => first,
            _ => host,
        };
        Self(label.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip a `:port` suffix, leaving bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Bus topic carrying both requests to and replies from `id`
pub fn topic(id: &ClientId) -> String {
    format!("{}{}", TOPIC_NAMESPACE, id.as_str())
}

/// Correlation token minted for every tunnelled request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
