//! Bounded worker pool with a FIFO admission queue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{watch, Notify};
use tokio::time::timeout;

use crate::config::PoolConfig;
use crate::observability::metrics;

/// A unit of work the pool can run.
pub trait Task: Send + 'static {
    fn run(self) -> impl Future<Output = ()> + Send + 'static;
}

/// Why a task was not admitted. The task is handed back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError<T> {
    #[error("worker pool saturated")]
    Saturated(T),
    #[error("worker pool is shutting down")]
    Closed(T),
}

impl<T> SubmitError<T> {
    pub fn into_task(self) -> T {
        match self {
            SubmitError::Saturated(task) | SubmitError::Closed(task) => task,
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers currently running a task.
    pub active: usize,
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks refused since startup.
    pub rejected: u64,
    /// Tasks that ran to completion (or were cancelled while running).
    pub completed: u64,
}

/// Outcome of [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// All admitted work finished within the grace period.
    pub drained: bool,
    /// Running plus queued tasks that were cancelled after the grace period.
    pub cancelled: usize,
}

struct State<T> {
    active: usize,
    queue: VecDeque<T>,
    rejected: u64,
    completed: u64,
    closed: bool,
}

struct Shared<T> {
    config: PoolConfig,
    state: Mutex<State<T>>,
    idle: Notify,
    cancel: watch::Sender<bool>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs at most `max_workers` tasks at once and queues up to
/// `queue_capacity` more; anything beyond that is rejected immediately.
pub struct WorkerPool<T: Task> {
    shared: Arc<Shared<T>>,
}

impl<T: Task> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Task> WorkerPool<T> {
    pub fn new(config: PoolConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    active: 0,
                    queue: VecDeque::new(),
                    rejected: 0,
                    completed: 0,
                    closed: false,
                }),
                idle: Notify::new(),
                cancel,
            }),
        }
    }

    /// Admit a task: start it now if a worker is free, otherwise queue it if
    /// there is room, otherwise hand it back.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, task: T) -> Result<(), SubmitError<T>> {
        let mut state = self.shared.lock();
        if state.closed {
            state.rejected += 1;
            return Err(SubmitError::Closed(task));
        }
        if state.active < self.shared.config.max_workers {
            state.active += 1;
            metrics::record_pool(state.active, state.queue.len());
            drop(state);
            self.spawn_worker(task);
            return Ok(());
        }
        if state.queue.len() < self.shared.config.queue_capacity {
            state.queue.push_back(task);
            metrics::record_pool(state.active, state.queue.len());
            return Ok(());
        }
        state.rejected += 1;
        Err(SubmitError::Saturated(task))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            active: state.active,
            queued: state.queue.len(),
            rejected: state.rejected,
            completed: state.completed,
        }
    }

    /// Wait until nothing is running or queued.
    pub async fn idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.lock();
                if state.active == 0 && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Stop admitting work, let admitted work drain for the grace period,
    /// then cancel whatever is left.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shared.lock().closed = true;
        let grace = self.shared.config.shutdown_grace();

        if timeout(grace, self.idle()).await.is_ok() {
            tracing::info!("Worker pool drained");
            return ShutdownReport {
                drained: true,
                cancelled: 0,
            };
        }

        let (dropped, running) = {
            let mut state = self.shared.lock();
            (std::mem::take(&mut state.queue), state.active)
        };
        let cancelled = dropped.len() + running;
        drop(dropped);
        tracing::warn!(
            cancelled,
            grace_ms = grace.as_millis() as u64,
            "Grace period elapsed, cancelling remaining work"
        );
        self.shared.cancel.send_replace(true);
        self.idle().await;

        ShutdownReport {
            drained: false,
            cancelled,
        }
    }

    fn spawn_worker(&self, first: T) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut cancel = shared.cancel.subscribe();
            let mut task = first;
            loop {
                // Run each task in its own Tokio task so a panic or abort
                // never takes the worker slot down with it.
                let handle = tokio::spawn(task.run());
                let abort = handle.abort_handle();
                tokio::select! {
                    joined = handle => {
                        if let Err(err) = joined {
                            if err.is_panic() {
                                tracing::error!("Connection task panicked");
                            }
                        }
                    }
                    _ = cancelled(&mut cancel) => {
                        abort.abort();
                    }
                }

                let mut state = shared.lock();
                state.completed += 1;
                match state.queue.pop_front() {
                    Some(next) => {
                        metrics::record_pool(state.active, state.queue.len());
                        task = next;
                    }
                    None => {
                        state.active -= 1;
                        metrics::record_pool(state.active, state.queue.len());
                        if state.active == 0 {
                            shared.idle.notify_waiters();
                        }
                        return;
                    }
                }
            }
        });
    }
}

/// Resolve once shutdown has flipped the cancel flag.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
