//! What may be cached, under which key, and for how long.

use std::time::Duration;

use http::{Method, StatusCode};

use crate::proto::request::{Request, Target};
use crate::proto::response::{version_str, Framing, ResponseHead};

/// Request headers that select between response variants.
const VARY_ON: &[&str] = &["accept", "accept-encoding", "accept-language"];

const CONDITIONAL: &[&str] = &[
    "if-none-match",
    "if-modified-since",
    "if-match",
    "if-unmodified-since",
    "if-range",
];

const CACHEABLE_STATUS: &[StatusCode] = &[
    StatusCode::OK,
    StatusCode::NON_AUTHORITATIVE_INFORMATION,
    StatusCode::NO_CONTENT,
    StatusCode::MULTIPLE_CHOICES,
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::NOT_FOUND,
    StatusCode::GONE,
];

/// Identity of a cached response: method, canonical URI, HTTP version and
/// the request headers responses commonly vary on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for `request`, or `None` when it has no resolvable destination.
    pub fn for_request(request: &Request) -> Option<Self> {
        let (host, port) = request.destination()?;
        let path = match &request.target {
            Target::Authority { .. } => return None,
            target => target.path(),
        };
        // Stored bodies keep the origin's framing, which depends on the
        // version the request was forwarded with.
        let mut key = format!(
            "{} http://{}:{}{} {}",
            request.method,
            host.to_ascii_lowercase(),
            port,
            path,
            version_str(request.version)
        );
        for name in VARY_ON {
            key.push('\n');
            key.push_str(request.headers.get(name).unwrap_or_default());
        }
        Some(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A request may be answered from (and stored into) the cache.
pub fn request_is_cacheable(request: &Request) -> bool {
    if request.method != Method::GET || request.body.is_some() {
        return false;
    }
    let headers = &request.headers;
    if headers.contains("authorization") || headers.contains("range") {
        return false;
    }
    if CONDITIONAL.iter().any(|name| headers.contains(name)) {
        return false;
    }
    let directives = headers.tokens("cache-control");
    if directives.iter().any(|d| d == "no-store" || d == "no-cache") {
        return false;
    }
    !headers.has_token("pragma", "no-cache")
}

/// How long a response may be stored, or `None` if it must not be.
///
/// The origin's `s-maxage` / `max-age` can shorten `default_ttl` but never
/// extend it.
pub fn response_ttl(head: &ResponseHead, framing: Framing, default_ttl: Duration) -> Option<Duration> {
    if !CACHEABLE_STATUS.contains(&head.status) || !framing.is_delimited() {
        return None;
    }
    if head.headers.contains("set-cookie") || head.headers.has_token("vary", "*") {
        return None;
    }

    let mut max_age = None;
    let mut shared_max_age = None;
    for directive in head.headers.tokens("cache-control") {
        let (name, value) = match directive.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
            None => (directive.as_str(), None),
        };
        match name {
            "no-store" | "no-cache" | "private" => return None,
            "max-age" => max_age = value.and_then(|v| v.parse::<u64>().ok()),
            "s-maxage" => shared_max_age = value.and_then(|v| v.parse::<u64>().ok()),
            _ => {}
        }
    }

    match shared_max_age.or(max_age) {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs).min(default_ttl)),
        None => Some(default_ttl),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::parser::{ParserLimits, RequestParser};

    fn request(raw: &str) -> Request {
        let mut parser = RequestParser::new(ParserLimits::default());
        parser.feed(raw.as_bytes());
        parser.parse().unwrap().unwrap()
    }

    fn head(raw: &str) -> ResponseHead {
        ResponseHead::parse(raw.as_bytes()).unwrap()
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn absolute_and_origin_forms_share_a_key() {
        let absolute = request("GET http://Example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let origin = request("GET /a?b=1 HTTP/1.1\r\nHost: example.com:80\r\n\r\n");
        assert_eq!(
            CacheKey::for_request(&absolute),
            CacheKey::for_request(&origin)
        );
    }

    #[test]
    fn key_varies_on_accept_encoding() {
        let plain = request("GET http://h/x HTTP/1.1\r\n\r\n");
        let gzip = request("GET http://h/x HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n");
        assert_ne!(CacheKey::for_request(&plain), CacheKey::for_request(&gzip));
    }

    #[test]
    fn key_varies_on_http_version() {
        let http11 = request("GET http://h/x HTTP/1.1\r\n\r\n");
        let http10 = request("GET http://h/x HTTP/1.0\r\n\r\n");
        assert_ne!(CacheKey::for_request(&http11), CacheKey::for_request(&http10));
    }

    #[test]
    fn connect_has_no_key() {
        let connect = request("CONNECT h:443 HTTP/1.1\r\nHost: h:443\r\n\r\n");
        assert!(CacheKey::for_request(&connect).is_none());
    }

    #[test]
    fn request_cacheability() {
        assert!(request_is_cacheable(&request("GET http://h/ HTTP/1.1\r\n\r\n")));
        for raw in [
            "HEAD http://h/ HTTP/1.1\r\n\r\n",
            "POST http://h/ HTTP/1.1\r\nContent-Length: 1\r\n\r\nx",
            "GET http://h/ HTTP/1.1\r\nAuthorization: Basic x\r\n\r\n",
            "GET http://h/ HTTP/1.1\r\nRange: bytes=0-1\r\n\r\n",
            "GET http://h/ HTTP/1.1\r\nIf-None-Match: \"a\"\r\n\r\n",
            "GET http://h/ HTTP/1.1\r\nCache-Control: no-cache\r\n\r\n",
            "GET http://h/ HTTP/1.1\r\nPragma: no-cache\r\n\r\n",
        ] {
            assert!(!request_is_cacheable(&request(raw)), "{raw}");
        }
    }

    #[test]
    fn ttl_respects_max_age_ceiling() {
        let short = head("HTTP/1.1 200 OK\r\nCache-Control: public, max-age=5\r\n\r\n");
        assert_eq!(
            response_ttl(&short, Framing::Length(1), TTL),
            Some(Duration::from_secs(5))
        );
        let long = head("HTTP/1.1 200 OK\r\nCache-Control: max-age=3600\r\n\r\n");
        assert_eq!(response_ttl(&long, Framing::Length(1), TTL), Some(TTL));
        let shared = head("HTTP/1.1 200 OK\r\nCache-Control: max-age=30, s-maxage=10\r\n\r\n");
        assert_eq!(
            response_ttl(&shared, Framing::Length(1), TTL),
            Some(Duration::from_secs(10))
        );
        let plain = head("HTTP/1.1 404 Not Found\r\n\r\n");
        assert_eq!(response_ttl(&plain, Framing::Empty, TTL), Some(TTL));
    }

    #[test]
    fn uncacheable_responses() {
        for raw in [
            "HTTP/1.1 500 Internal Server Error\r\n\r\n",
            "HTTP/1.1 200 OK\r\nCache-Control: private\r\n\r\n",
            "HTTP/1.1 200 OK\r\nCache-Control: no-store\r\n\r\n",
            "HTTP/1.1 200 OK\r\nCache-Control: max-age=0\r\n\r\n",
            "HTTP/1.1 200 OK\r\nSet-Cookie: a=b\r\n\r\n",
            "HTTP/1.1 200 OK\r\nVary: *\r\n\r\n",
        ] {
            assert_eq!(response_ttl(&head(raw), Framing::Length(1), TTL), None, "{raw}");
        }
        let ok = head("HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(response_ttl(&ok, Framing::UntilClose, TTL), None);
    }
}
