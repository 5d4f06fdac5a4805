//! Forward-proxy core.
//!
//! # Data Flow
//! ```text
//! ClientTask (task.rs) picked up by a worker
//!     → ConnectionHandler (handler.rs)
//!         Reading → [cache hit] ──────────────────────────────┐
//!         Reading → Resolving → Forwarding → Relaying ────────┤
//!                                                             ├→ keep-alive? → Reading
//!         CONNECT: Resolving → 200 → tunnel until both close  │
//!         errors → error response if nothing sent yet → Closing
//!
//! ProxyServer (server.rs)
//!     → owns the pool, context and background tasks
//!     → runs the listener, then drains the pool on shutdown
//! ```
//!
//! # Design Decisions
//! - Shared state is passed explicitly as `Arc<ProxyContext>`
//! - A connection is served start to finish by one worker

pub mod context;
pub mod handler;
pub mod server;
pub mod task;

pub use context::ProxyContext;
pub use handler::{ConnectionHandler, Phase};
pub use server::ProxyServer;
pub use task::ClientTask;
