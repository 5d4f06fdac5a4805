//! Parsed client request.

use bytes::Bytes;
use http::{Method, Version};

use crate::proto::headers::Headers;
use crate::proto::response::version_str;

/// Where a request points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `http://host:port/path?query` (absolute-form, the usual proxy form).
    Absolute {
        scheme: String,
        host: String,
        port: u16,
        path: String,
    },
    /// `host:port` (authority-form, only for CONNECT).
    Authority { host: String, port: u16 },
    /// `/path?query` (origin-form); the destination comes from `Host`.
    Origin(String),
}

impl Target {
    /// Path and query to put on the upstream request line.
    pub fn path(&self) -> &str {
        match self {
            Target::Absolute { path, .. } | Target::Origin(path) => path,
            Target::Authority { .. } => "/",
        }
    }
}

/// A complete request as received from a client.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub target: Target,
    pub version: Version,
    pub headers: Headers,
    pub body: Option<Bytes>,
    /// The request-target exactly as it appeared on the request line.
    pub raw_target: String,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Destination `(host, port)` for the upstream connection.
    ///
    /// Absolute and authority targets carry it directly; origin-form targets
    /// fall back to the `Host` header with port 80.
    pub fn destination(&self) -> Option<(String, u16)> {
        match &self.target {
            Target::Absolute { host, port, .. } | Target::Authority { host, port } => {
                Some((host.clone(), *port))
            }
            Target::Origin(_) => self.headers.get("host").and_then(|h| split_authority(h, 80)),
        }
    }

    /// Whether the client asked to keep the connection open after this exchange.
    pub fn wants_keep_alive(&self) -> bool {
        let connection_close = self.headers.has_token("connection", "close")
            || self.headers.has_token("proxy-connection", "close");
        let connection_keep_alive = self.headers.has_token("connection", "keep-alive")
            || self.headers.has_token("proxy-connection", "keep-alive");
        match self.version {
            Version::HTTP_11 => !connection_close,
            _ => connection_keep_alive && !connection_close,
        }
    }

    /// Value for the upstream `Host` header.
    pub fn host_header(&self) -> Option<String> {
        match &self.target {
            Target::Absolute { scheme, host, port, .. } => {
                let default = default_port(scheme);
                Some(format_authority(host, *port, default))
            }
            Target::Authority { host, port } => Some(format_authority(host, *port, 0)),
            Target::Origin(_) => self.headers.get("host").map(str::to_string),
        }
    }

    /// Serialize in origin-form for the upstream hop.
    ///
    /// Hop-by-hop headers are dropped, `Host` is made to match the target and
    /// the `Connection` header reflects whether the upstream link is reused.
    pub fn to_upstream_bytes(&self, keep_alive: bool) -> Vec<u8> {
        let mut headers = self.headers.clone();
        headers.remove_hop_by_hop();
        if let (Target::Absolute { .. }, Some(host)) = (&self.target, self.host_header()) {
            headers.set("Host", host);
        }

        let body = self.body.as_deref().unwrap_or_default();
        let mut out = Vec::with_capacity(512 + body.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.path().as_bytes());
        out.push(b' ');
        out.extend_from_slice(version_str(self.version).as_bytes());
        out.extend_from_slice(b"\r\n");
        headers.write_to(&mut out);
        out.extend_from_slice(if keep_alive {
            b"Connection: keep-alive\r\n\r\n"
        } else {
            b"Connection: close\r\n\r\n"
        });
        out.extend_from_slice(body);
        out
    }
}

/// Default port for a URI scheme.
pub fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
pub fn split_authority(authority: &str, default: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        }
        Some(_) => None,
        None => Some((authority.to_string(), default)),
    }
}

fn format_authority(host: &str, port: u16, default: u16) -> String {
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if port == default {
        host
    } else {
        format!("{host}:{port}")
    }
}
