//! Error taxonomy for the proxy.
//!
//! Every per-connection failure is a [`ProxyError`]. The handler decides from
//! [`ProxyError::status`] whether the client still gets an error response.
//! Only [`ProxyError::Bind`] is fatal to the process.

use http::StatusCode;
use std::time::Duration;

use crate::pool::SubmitError;
use crate::proto::parser::ParseError;

/// Errors produced while accepting, parsing, forwarding or relaying.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The listen address could not be bound at startup.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker pool is at capacity; the connection is dropped unanswered.
    #[error("worker pool saturated")]
    PoolSaturated,

    /// The client sent something that is not a usable request.
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),

    /// A configured request limit was exceeded.
    #[error("request too large: {0}")]
    RequestTooLarge(&'static str),

    /// The origin could not be connected to.
    #[error("upstream {authority} unreachable (timed out: {timed_out}): {source}")]
    UpstreamUnreachable {
        authority: String,
        timed_out: bool,
        #[source]
        source: std::io::Error,
    },

    /// The origin host name did not resolve.
    #[error("upstream {authority} did not resolve: {reason}")]
    UpstreamUnresolvable { authority: String, reason: String },

    /// The origin answered with something that is not an HTTP response.
    #[error("invalid upstream response: {0}")]
    UpstreamProtocol(&'static str),

    /// The origin went quiet before its response head was complete.
    #[error("upstream sent nothing for {0:?}")]
    UpstreamIdle(Duration),

    /// No bytes moved in either direction for the idle window.
    #[error("idle for more than {0:?}")]
    IdleTimeout(Duration),

    /// The exchange or connection exceeded its total time budget.
    #[error("exceeded total time budget of {0:?}")]
    TotalTimeout(Duration),

    /// An I/O error while copying between the two sides.
    #[error("relay i/o error: {0}")]
    RelayIo(#[from] std::io::Error),

    /// The client went away before a request was complete.
    #[error("client closed the connection")]
    ClientClosed,
}

impl ProxyError {
    /// Status code the client should see, if an error response applies.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ProxyError::MalformedRequest(_) => Some(StatusCode::BAD_REQUEST),
            ProxyError::RequestTooLarge(_) => Some(StatusCode::PAYLOAD_TOO_LARGE),
            ProxyError::UpstreamUnreachable { timed_out: true, .. } => {
                Some(StatusCode::GATEWAY_TIMEOUT)
            }
            ProxyError::UpstreamUnreachable { .. }
            | ProxyError::UpstreamUnresolvable { .. }
            | ProxyError::UpstreamProtocol(_) => Some(StatusCode::BAD_GATEWAY),
            ProxyError::UpstreamIdle(_) | ProxyError::TotalTimeout(_) => {
                Some(StatusCode::GATEWAY_TIMEOUT)
            }
            ProxyError::Bind { .. }
            | ProxyError::PoolSaturated
            | ProxyError::IdleTimeout(_)
            | ProxyError::RelayIo(_)
            | ProxyError::ClientClosed => None,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Bind { .. } => "bind",
            ProxyError::PoolSaturated => "pool_saturated",
            ProxyError::MalformedRequest(_) => "malformed_request",
            ProxyError::RequestTooLarge(_) => "request_too_large",
            ProxyError::UpstreamUnreachable { .. } => "upstream_unreachable",
            ProxyError::UpstreamUnresolvable { .. } => "upstream_unresolvable",
            ProxyError::UpstreamProtocol(_) => "upstream_protocol",
            ProxyError::UpstreamIdle(_) => "upstream_idle",
            ProxyError::IdleTimeout(_) => "idle_timeout",
            ProxyError::TotalTimeout(_) => "total_timeout",
            ProxyError::RelayIo(_) => "relay_io",
            ProxyError::ClientClosed => "client_closed",
        }
    }
}

impl From<ParseError> for ProxyError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Malformed(reason) => ProxyError::MalformedRequest(reason),
            ParseError::TooLarge(reason) => ProxyError::RequestTooLarge(reason),
        }
    }
}

impl<T> From<SubmitError<T>> for ProxyError {
    /// The rejected task (and its socket) is dropped here.
    fn from(_: SubmitError<T>) -> Self {
        ProxyError::PoolSaturated
    }
}

/// Render a minimal `text/plain` error response that closes the connection.
pub fn error_response(status: StatusCode, message: &str) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("Error");
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        reason,
        message.len(),
        message
    )
    .into_bytes()
}
