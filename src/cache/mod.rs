//! Response cache subsystem.
//!
//! # Data Flow
//! ```text
//! Request arrives
//!     → policy.rs (is the request cacheable? build CacheKey)
//!     → store.rs lookup (hit → replay stored response)
//!
//! Response relayed
//!     → policy.rs (is the response cacheable? TTL)
//!     → store.rs insert (LRU eviction within the shard)
//!
//! Background
//!     → sweeper task drops expired entries periodically
//! ```
//!
//! # Design Decisions
//! - Sharded maps, one mutex per shard; the key hash picks the shard
//! - Expired entries are never served: checked on lookup, swept in background
//! - Entry and byte bounds are enforced per shard

pub mod policy;
pub mod store;

pub use policy::{request_is_cacheable, response_ttl, CacheKey};
pub use store::{CacheStats, CachedResponse, ResponseCache};
