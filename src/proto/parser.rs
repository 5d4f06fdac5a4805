//! Incremental HTTP/1.x request parser.
//!
//! # Responsibilities
//! - Accumulate client bytes across any number of reads
//! - Detect the end of the header section without rescanning old bytes,
//!   then tokenize it with httparse
//! - Enforce header size, header count, URI length and body size limits
//! - Hand back a complete [`Request`] once its declared body has arrived
//!
//! # Design Decisions
//! - The head is discarded as soon as it is parsed; only body bytes and any
//!   bytes belonging to the next pipelined request stay buffered
//! - Chunked request bodies are refused rather than decoded
//! - Limits are checked before the whole message is buffered

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{Method, Version};
use httparse::Status;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::config::LimitsConfig;
use crate::error::ProxyError;
use crate::proto::headers::Headers;
use crate::proto::request::{default_port, split_authority, Request, Target};

const READ_CHUNK: usize = 8 * 1024;

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Maps to `400 Bad Request`.
    #[error("malformed: {0}")]
    Malformed(&'static str),
    /// Maps to `413 Payload Too Large`.
    #[error("too large: {0}")]
    TooLarge(&'static str),
}

/// Size limits applied while parsing.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_header_bytes: usize,
    pub max_headers: usize,
    pub max_uri_length: usize,
    pub max_body_bytes: usize,
}

impl From<&LimitsConfig> for ParserLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_header_bytes: config.max_header_bytes,
            max_headers: config.max_headers,
            max_uri_length: config.max_uri_length,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

struct Head {
    method: Method,
    target: Target,
    raw_target: String,
    version: Version,
    headers: Headers,
}

/// Resumable request parser bound to one client connection.
pub struct RequestParser {
    limits: ParserLimits,
    buf: BytesMut,
    /// Bytes of `buf` already searched for the end of the head.
    scanned: usize,
    /// Head parsed, body still arriving.
    pending: Option<(Head, usize)>,
}

impl RequestParser {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            limits,
            buf: BytesMut::with_capacity(READ_CHUNK),
            scanned: 0,
            pending: None,
        }
    }

    /// Append freshly read bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// True if no partial request is buffered.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none() && self.buf.iter().all(|b| matches!(b, b'\r' | b'\n'))
    }

    /// Bytes received past the last complete request (e.g. early tunnel data).
    pub fn take_buffered(&mut self) -> Bytes {
        self.scanned = 0;
        self.buf.split().freeze()
    }

    /// Try to produce a request from what has been fed so far.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn parse(&mut self) -> Result<Option<Request>, ParseError> {
        if self.pending.is_none() {
            self.skip_leading_newlines();
            if self.find_head_end()?.is_none() {
                return Ok(None);
            }
            let Some((head, body_len, head_len)) = parse_head(&self.buf, &self.limits)? else {
                self.scanned = self.buf.len();
                return Ok(None);
            };
            let _ = self.buf.split_to(head_len);
            self.scanned = 0;
            self.pending = Some((head, body_len));
        }

        let body_len = match &self.pending {
            Some((_, len)) => *len,
            None => return Ok(None),
        };
        if self.buf.len() < body_len {
            return Ok(None);
        }
        let Some((head, _)) = self.pending.take() else {
            return Ok(None);
        };
        let body = (body_len > 0).then(|| self.buf.split_to(body_len).freeze());

        Ok(Some(Request {
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
            body,
            raw_target: head.raw_target,
        }))
    }

    /// Read from `stream` until a full request is available.
    ///
    /// `Ok(None)` means the client closed cleanly between requests.
    pub async fn read_request<S>(
        &mut self,
        stream: &mut S,
        idle: Duration,
    ) -> Result<Option<Request>, ProxyError>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            if let Some(request) = self.parse()? {
                return Ok(Some(request));
            }
            self.buf.reserve(READ_CHUNK);
            let n = match timeout(idle, stream.read_buf(&mut self.buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(ProxyError::IdleTimeout(idle)),
            };
            if n == 0 {
                return if self.is_idle() {
                    Ok(None)
                } else {
                    Err(ProxyError::MalformedRequest("connection closed mid-request"))
                };
            }
        }
    }

    fn skip_leading_newlines(&mut self) {
        let skip = self
            .buf
            .iter()
            .take_while(|b| matches!(b, b'\r' | b'\n'))
            .count();
        if skip > 0 {
            let _ = self.buf.split_to(skip);
            self.scanned = self.scanned.saturating_sub(skip);
        }
    }

    /// Length of the head including its blank line, once present.
    fn find_head_end(&mut self) -> Result<Option<usize>, ParseError> {
        // Back up a little so a terminator split across reads is still seen.
        let start = self.scanned.saturating_sub(3);
        for nl in memchr::memchr_iter(b'\n', &self.buf[start..]) {
            let at = start + nl;
            let rest = &self.buf[at + 1..];
            let end = if rest.starts_with(b"\r\n") {
                Some(at + 3)
            } else if rest.starts_with(b"\n") {
                Some(at + 2)
            } else {
                None
            };
            if let Some(end) = end {
                if end > self.limits.max_header_bytes {
                    return Err(ParseError::TooLarge("header section"));
                }
                return Ok(Some(end));
            }
        }
        if self.buf.len() > self.limits.max_header_bytes {
            return Err(ParseError::TooLarge("header section"));
        }
        self.scanned = self.buf.len();
        Ok(None)
    }
}

/// Tokenize the head at the front of `buf`.
///
/// `Ok(None)` means httparse wants more bytes. On success the head and its
/// declared body length are returned with the number of head bytes consumed.
fn parse_head(
    buf: &[u8],
    limits: &ParserLimits,
) -> Result<Option<(Head, usize, usize)>, ParseError> {
    let mut slots = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let mut req = httparse::Request::new(&mut slots);
    let head_len = match req.parse(buf) {
        Ok(Status::Complete(n)) => n,
        Ok(Status::Partial) => return Ok(None),
        Err(e) => return Err(request_error(e)),
    };
    if head_len > limits.max_header_bytes {
        return Err(ParseError::TooLarge("header section"));
    }

    let (Some(method), Some(target), Some(version)) = (req.method, req.path, req.version) else {
        return Err(ParseError::Malformed("invalid request line"));
    };
    if target.len() > limits.max_uri_length {
        return Err(ParseError::TooLarge("request URI"));
    }
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| ParseError::Malformed("invalid method"))?;
    let version = match version {
        1 => Version::HTTP_11,
        _ => Version::HTTP_10,
    };

    let mut headers = Headers::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| ParseError::Malformed("invalid header value"))?;
        headers.append(header.name, value.trim_matches(|c| c == ' ' || c == '\t'));
    }

    let raw_target = target.to_string();
    let target = parse_target(&method, target)?;
    if matches!(target, Target::Origin(_)) && !headers.contains("host") {
        return Err(ParseError::Malformed("missing Host header"));
    }

    let body_len = if method == Method::CONNECT {
        0
    } else {
        body_length(&headers, limits)?
    };

    Ok(Some((
        Head {
            method,
            raw_target,
            target,
            version,
            headers,
        },
        body_len,
        head_len,
    )))
}

fn request_error(err: httparse::Error) -> ParseError {
    match err {
        httparse::Error::TooManyHeaders => ParseError::TooLarge("too many header fields"),
        httparse::Error::Version => ParseError::Malformed("unsupported HTTP version"),
        httparse::Error::HeaderName => ParseError::Malformed("invalid header name"),
        httparse::Error::HeaderValue => ParseError::Malformed("invalid header value"),
        httparse::Error::NewLine => ParseError::Malformed("invalid line ending"),
        _ => ParseError::Malformed("invalid request line"),
    }
}

fn parse_target(method: &Method, raw: &str) -> Result<Target, ParseError> {
    if *method == Method::CONNECT {
        return split_authority(raw, 443)
            .filter(|_| !raw.contains('/'))
            .map(|(host, port)| Target::Authority { host, port })
            .ok_or(ParseError::Malformed("CONNECT requires an authority target"));
    }
    if raw.starts_with('/') || raw == "*" {
        return Ok(Target::Origin(raw.to_string()));
    }
    let Some((scheme, rest)) = raw.split_once("://") else {
        return Err(ParseError::Malformed("invalid request target"));
    };
    if !scheme.eq_ignore_ascii_case("http") {
        return Err(ParseError::Malformed("unsupported URI scheme"));
    }

    let url = url::Url::parse(raw).map_err(|_| ParseError::Malformed("invalid absolute URI"))?;
    let host = url
        .host_str()
        .ok_or(ParseError::Malformed("absolute URI without host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port().unwrap_or_else(|| default_port(scheme));

    // Keep the client's path bytes; the url crate would re-encode them.
    let path_start = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let path = rest[path_start..].split('#').next().unwrap_or_default();
    let path = if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('?') {
        format!("/{path}")
    } else {
        path.to_string()
    };

    Ok(Target::Absolute {
        scheme: scheme.to_ascii_lowercase(),
        host,
        port,
        path,
    })
}

fn body_length(headers: &Headers, limits: &ParserLimits) -> Result<usize, ParseError> {
    if headers.contains("transfer-encoding") {
        return Err(ParseError::Malformed("chunked request bodies are not supported"));
    }
    let mut length: Option<usize> = None;
    for value in headers.get_all("content-length") {
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::Malformed("invalid Content-Length"));
            }
            let parsed: usize = part
                .parse()
                .map_err(|_| ParseError::TooLarge("request body"))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(ParseError::Malformed("conflicting Content-Length"));
                }
                _ => length = Some(parsed),
            }
        }
    }
    let length = length.unwrap_or(0);
    if length > limits.max_body_bytes {
        return Err(ParseError::TooLarge("request body"));
    }
    Ok(length)
}
