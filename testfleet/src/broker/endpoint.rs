//! Connection targets derived from the farm's opaque endpoint strings
//!
//! `https://farm-7.example.com:443/wd/hub` → protocol `https`, host
//! `farm-7.example.com`, port `443`, path `/wd/hub`. Protocol and port fall
//! back to configured defaults when the endpoint omits them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default automation server port
pub const DEFAULT_PORT: u16 = 4723;

/// Default automation server protocol
pub const DEFAULT_PROTOCOL: &str = "http";

/// Where the automation session should connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Path after the authority, empty or starting with `/`
    pub path: String,
}

impl ConnectionTarget {
    /// Parse `endpoint`, applying `default_protocol` / `default_port` when
    /// absent. Returns `None` for an empty host or a non-numeric port.
    pub fn parse(endpoint: &str, default_protocol: &str, default_port: u16) -> Option<Self> {
        let endpoint = endpoint.trim();
        let (protocol, rest) = match endpoint.split_once("://") {
            Some((protocol, rest)) if !protocol.is_empty() => (protocol, rest),
            Some((_, rest)) => (default_protocol, rest),
            None => (default_protocol, endpoint),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port) = split_host_port(authority)?;
        let port = match port {
            Some(port) => port.parse::<u16>().ok()?,
            None => default_port,
        };

        if host.is_empty() {
            return None;
        }

        Some(Self {
            protocol: protocol.to_ascii_lowercase(),
            host: host.to_string(),
            port,
            path: path.trim_end_matches('/').to_string(),
        })
    }

    /// Parse with the standard defaults (`http`, 4723)
    pub fn parse_with_defaults(endpoint: &str) -> Option<Self> {
        Self::parse(endpoint, DEFAULT_PROTOCOL, DEFAULT_PORT)
    }

    /// Full URL, e.g. `http://127.0.0.1:4723/wd/hub`
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, self.path)
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Split `host[:port]`, keeping bracketed IPv6 hosts intact
fn split_host_port(authority: &str) -> Option<(&str, Option<&str>)> {
    if let Some(stripped) = authority.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &authority[..end + 2];
        let after = &stripped[end + 1..];
        return match after.strip_prefix(':') {
            Some(port) => Some((host, Some(port))),
            None if after.is_empty() => Some((host, None)),
            None => None,
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port))),
        None => Some((authority, None)),
    }
}
