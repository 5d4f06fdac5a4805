//! Upstream response heads.
//!
//! Only the status line and headers are interpreted. The body is relayed as
//! raw bytes; [`Framing`] says where it ends.

use std::time::Duration;

use bytes::BytesMut;
use http::{Method, StatusCode, Version};
use httparse::Status;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::ProxyError;
use crate::proto::headers::Headers;

const MAX_RESPONSE_HEADERS: usize = 128;

/// How the end of a response body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all (HEAD, 1xx, 204, 304).
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Body runs until the origin closes the connection.
    UntilClose,
}

impl Framing {
    /// Whether the end of the body is known without closing the connection.
    pub fn is_delimited(&self) -> bool {
        !matches!(self, Framing::UntilClose)
    }
}

/// Parsed status line and headers of an upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// Parse a complete head (status line through the blank line).
    pub fn parse(raw: &[u8]) -> Result<Self, ProxyError> {
        match Self::try_parse(raw)? {
            Some((head, _)) => Ok(head),
            None => Err(ProxyError::UpstreamProtocol("incomplete response head")),
        }
    }

    /// Parse the head at the front of `buf`, returning it with its length,
    /// or `None` if the blank line has not arrived yet.
    pub fn try_parse(buf: &[u8]) -> Result<Option<(Self, usize)>, ProxyError> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut resp = httparse::Response::new(&mut slots);
        let len = match resp.parse(buf) {
            Ok(Status::Complete(n)) => n,
            Ok(Status::Partial) => return Ok(None),
            Err(httparse::Error::TooManyHeaders) => {
                return Err(ProxyError::UpstreamProtocol("too many response headers"))
            }
            Err(httparse::Error::Version) => {
                return Err(ProxyError::UpstreamProtocol("unsupported response version"))
            }
            Err(httparse::Error::Status) => {
                return Err(ProxyError::UpstreamProtocol("invalid status code"))
            }
            Err(_) => return Err(ProxyError::UpstreamProtocol("invalid response head")),
        };

        let version = match resp.version {
            Some(1) => Version::HTTP_11,
            _ => Version::HTTP_10,
        };
        let status = resp
            .code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or(ProxyError::UpstreamProtocol("invalid status code"))?;

        let mut headers = Headers::with_capacity(resp.headers.len());
        for header in resp.headers.iter() {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| ProxyError::UpstreamProtocol("invalid response header"))?;
            headers.append(header.name, value.trim());
        }

        Ok(Some((
            Self {
                version,
                status,
                reason: resp.reason.unwrap_or_default().to_string(),
                headers,
            },
            len,
        )))
    }

    /// Body framing for a response to `method`.
    pub fn framing(&self, method: &Method) -> Result<Framing, ProxyError> {
        if *method == Method::HEAD
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return Ok(Framing::Empty);
        }
        if self.headers.contains("transfer-encoding") {
            let codings = self.headers.tokens("transfer-encoding");
            return Ok(match codings.last().map(String::as_str) {
                Some("chunked") => Framing::Chunked,
                _ => Framing::UntilClose,
            });
        }
        let mut length: Option<u64> = None;
        for value in self.headers.get_all("content-length") {
            for part in value.split(',') {
                let parsed: u64 = part
                    .trim()
                    .parse()
                    .map_err(|_| ProxyError::UpstreamProtocol("invalid Content-Length"))?;
                if length.is_some_and(|l| l != parsed) {
                    return Err(ProxyError::UpstreamProtocol("conflicting Content-Length"));
                }
                length = Some(parsed);
            }
        }
        Ok(match length {
            Some(0) => Framing::Empty,
            Some(n) => Framing::Length(n),
            None => Framing::UntilClose,
        })
    }

    /// Whether the origin is willing to keep its connection open.
    pub fn is_persistent(&self) -> bool {
        let close = self.headers.has_token("connection", "close");
        match self.version {
            Version::HTTP_11 => !close,
            _ => !close && self.headers.has_token("connection", "keep-alive"),
        }
    }

    /// Serialize for the client: hop-by-hop headers dropped, our own
    /// `Connection` header appended.
    pub fn to_client_bytes(&self, keep_alive: bool) -> Vec<u8> {
        let mut headers = self.headers.clone();
        headers.remove_hop_by_hop();
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(version_str(self.version).as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        headers.write_to(&mut out);
        out.extend_from_slice(if keep_alive {
            b"Connection: keep-alive\r\n\r\n"
        } else {
            b"Connection: close\r\n\r\n"
        });
        out
    }

    /// Serialize unchanged (used for interim 1xx responses).
    pub fn to_raw_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(version_str(self.version).as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

pub fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Read a response head from `stream`.
///
/// Bytes following the head stay in `buf` as the start of the body.
pub async fn read_response_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_bytes: usize,
    idle: Duration,
) -> Result<ResponseHead, ProxyError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((head, len)) = ResponseHead::try_parse(&buf[..])? {
            if len > max_bytes {
                return Err(ProxyError::UpstreamProtocol("response head too large"));
            }
            let _ = buf.split_to(len);
            return Ok(head);
        }
        if buf.len() > max_bytes {
            return Err(ProxyError::UpstreamProtocol("response head too large"));
        }

        buf.reserve(8 * 1024);
        let n = match timeout(idle, stream.read_buf(buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProxyError::UpstreamIdle(idle)),
        };
        if n == 0 {
            return Err(ProxyError::UpstreamProtocol("upstream closed before responding"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> ResponseHead {
        ResponseHead::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn parses_status_and_headers() {
        let h = head("HTTP/1.1 404 Not Found\r\nContent-Length: 3\r\nX-A: b\r\n\r\n");
        assert_eq!(h.status, StatusCode::NOT_FOUND);
        assert_eq!(h.reason, "Not Found");
        assert_eq!(h.headers.get("x-a"), Some("b"));
        assert_eq!(h.framing(&Method::GET).unwrap(), Framing::Length(3));
    }

    #[test]
    fn framing_rules() {
        let chunked = head("HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert_eq!(chunked.framing(&Method::GET).unwrap(), Framing::Chunked);
        assert_eq!(chunked.framing(&Method::HEAD).unwrap(), Framing::Empty);

        let until_close = head("HTTP/1.0 200 OK\r\n\r\n");
        assert_eq!(until_close.framing(&Method::GET).unwrap(), Framing::UntilClose);
        assert!(!until_close.is_persistent());

        let not_modified = head("HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(not_modified.framing(&Method::GET).unwrap(), Framing::Empty);

        let bad = head("HTTP/1.1 200 OK\r\nContent-Length: 1, 2\r\n\r\n");
        assert!(bad.framing(&Method::GET).is_err());
    }

    #[test]
    fn client_bytes_replace_connection_headers() {
        let h = head("HTTP/1.1 200 OK\r\nConnection: close\r\nKeep-Alive: timeout=5\r\nContent-Length: 0\r\n\r\n");
        let out = String::from_utf8(h.to_client_bytes(true)).unwrap();
        assert_eq!(
            out,
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn rejects_non_http() {
        assert!(ResponseHead::parse(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(ResponseHead::parse(b"HTTP/1.1 abc OK\r\n\r\n").is_err());
        assert!(ResponseHead::parse(b"HTTP/1.1 200 OK\r\n").is_err());
    }

    #[test]
    fn try_parse_waits_for_blank_line() {
        assert!(ResponseHead::try_parse(b"HTTP/1.1 200 OK\r\nX-A: b\r\n").unwrap().is_none());
        let (h, len) = ResponseHead::try_parse(b"HTTP/1.1 204 No Content\r\n\r\nrest")
            .unwrap()
            .unwrap();
        assert_eq!(h.status, StatusCode::NO_CONTENT);
        assert_eq!(len, 27);
    }

    #[test]
    fn too_many_response_headers() {
        let mut raw = String::from("HTTP/1.1 200 OK\r\n");
        for i in 0..=MAX_RESPONSE_HEADERS {
            raw.push_str(&format!("X-{i}: v\r\n"));
        }
        raw.push_str("\r\n");
        assert!(matches!(
            ResponseHead::parse(raw.as_bytes()),
            Err(ProxyError::UpstreamProtocol("too many response headers"))
        ));
    }

    #[tokio::test]
    async fn reads_head_and_keeps_body_prefix() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel";
        let mut buf = BytesMut::new();
        let h = read_response_head(&mut input, &mut buf, 1024, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(h.status, StatusCode::OK);
        assert_eq!(&buf[..], b"hel");
    }

    #[tokio::test]
    async fn silent_upstream_is_upstream_idle() {
        let (_origin, mut upstream) = tokio::io::duplex(64);
        let mut buf = BytesMut::new();
        let err = read_response_head(&mut upstream, &mut buf, 1024, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamIdle(_)));
    }

    #[tokio::test]
    async fn early_close_is_protocol_error() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\n";
        let mut buf = BytesMut::new();
        let err = read_response_head(&mut input, &mut buf, 1024, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamProtocol(_)));
    }
}
