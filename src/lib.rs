//! Multithreaded HTTP/1.1 forward proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────────────┐
//!                       │                    FORWARD PROXY                      │
//!                       │                                                       │
//!   Client ─────────────┼─▶ net::Listener ──submit──▶ pool::WorkerPool         │
//!                       │        │ (saturated: drop)      │ N workers, Q queue │
//!                       │        ▼                        ▼                     │
//!                       │                      proxy::ConnectionHandler         │
//!                       │                  proto parser │ cache │ relay         │
//!                       │                               ▼                       │
//!                       │                      upstream::Connector ─────────────┼──▶ Origin
//!                       │                                                       │
//!                       │  config · error · lifecycle · observability           │
//!                       └──────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod error;
pub mod net;
pub mod pool;
pub mod proto;
pub mod proxy;
pub mod relay;
pub mod upstream;

// Traffic management
pub mod cache;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use lifecycle::Shutdown;
pub use net::Listener;
pub use proxy::ProxyServer;
