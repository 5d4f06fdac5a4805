//! Worker pool subsystem.
//!
//! # Admission
//! ```text
//! submit(task)
//!     → active < max_workers     → start on a free worker
//!     → queue < queue_capacity   → wait in FIFO queue
//!     → otherwise                → SubmitError::Saturated (caller closes it)
//!
//! worker finishes a task
//!     → pop next queued task, or release the worker slot
//! ```
//!
//! # Design Decisions
//! - Rejection instead of blocking keeps memory bounded under bursts
//! - One mutex guards the queue and counters; they change together
//! - Shutdown drains for a grace period, then cancels

pub mod worker_pool;

pub use worker_pool::{PoolStats, ShutdownReport, SubmitError, Task, WorkerPool};
