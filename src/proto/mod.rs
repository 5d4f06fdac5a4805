//! HTTP/1.x wire handling.
//!
//! # Data Flow
//! ```text
//! client bytes
//!     → parser.rs (resumable, limit-checked)
//!     → request.rs (Request, Target, destination)
//!     → [handler forwards upstream]
//! upstream bytes
//!     → response.rs (ResponseHead, Framing)
//!     → chunked.rs (end-of-body tracking, no decoding)
//! ```
//!
//! # Design Decisions
//! - Headers keep arrival order; lookups ignore case
//! - Bodies are relayed as raw bytes, never re-encoded
//! - Only framing-relevant headers are interpreted

pub mod chunked;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use parser::{ParseError, ParserLimits, RequestParser};
pub use request::{Request, Target};
pub use response::{Framing, ResponseHead};
