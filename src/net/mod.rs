//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, TCP_NODELAY)
//!     → connection.rs (connection id, open-connection tracking)
//!     → WorkerPool::submit(ClientTask)
//!         → admitted: runs now or waits in the FIFO queue
//!         → saturated: socket dropped, nothing written
//! ```
//!
//! # Design Decisions
//! - Admission never blocks the accept loop; rejection is the backpressure
//! - Each connection tracked from accept until its handler finishes

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::Listener;
