//! Upstream connection subsystem.
//!
//! # Data Flow
//! ```text
//! Handler needs (host, port)
//!     → pool.rs (reuse a parked, still-alive connection)
//!     → connector.rs (resolve → connect with deadline)
//!     → UpstreamConn handed to the handler
//!
//! Exchange finished, response persistent
//!     → Connector::release → parked in pool.rs
//! ```
//!
//! # Design Decisions
//! - Idle connections are keyed by (host, port) and reused LIFO
//! - A parked connection is probed before reuse; stale ones are dropped
//! - Connections are never shared between two handlers at once

pub mod connector;
pub mod pool;

pub use connector::{Connector, UpstreamConn};
pub use pool::IdlePool;
