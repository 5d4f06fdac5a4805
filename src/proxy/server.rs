//! Proxy server orchestration.
//!
//! # Responsibilities
//! - Build the shared context and the worker pool from configuration
//! - Start background maintenance (cache sweeper, idle upstream eviction)
//! - Run the accept loop until shutdown, then drain the pool

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::ProxyConfig;
use crate::lifecycle::Shutdown;
use crate::net::{ConnectionTracker, Listener};
use crate::pool::{ShutdownReport, WorkerPool};
use crate::proxy::context::ProxyContext;
use crate::proxy::task::ClientTask;

/// The forward proxy: listener, worker pool and shared state.
pub struct ProxyServer {
    config: ProxyConfig,
    context: Arc<ProxyContext>,
    pool: WorkerPool<ClientTask>,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        let context = Arc::new(ProxyContext::new(&config));
        let pool = WorkerPool::new(config.pool.clone());
        Self {
            config,
            context,
            pool,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.context
    }

    pub fn pool(&self) -> &WorkerPool<ClientTask> {
        &self.pool
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Serve until `shutdown` fires, then drain in-flight work.
    pub async fn run(self, listener: Listener, shutdown: Shutdown) -> ShutdownReport {
        let address = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.config.listener.bind_address.clone());
        tracing::info!(
            address = %address,
            max_workers = self.config.pool.max_workers,
            queue_capacity = self.config.pool.queue_capacity,
            cache_enabled = self.context.cache.is_some(),
            upstream_pool_enabled = self.context.connector.pooling_enabled(),
            "Proxy server starting"
        );

        let mut background = Vec::new();
        if let Some(cache) = &self.context.cache {
            let interval = self.config.cache.sweep_interval();
            if !interval.is_zero() {
                background.push(cache.spawn_sweeper(interval, shutdown.clone()));
            }
        }
        if self.context.connector.pooling_enabled() {
            background.push(spawn_idle_eviction(
                Arc::clone(&self.context),
                self.config.upstream.idle_stale(),
                shutdown.clone(),
            ));
        }

        listener
            .run(
                self.pool.clone(),
                Arc::clone(&self.context),
                self.tracker.clone(),
                shutdown.clone(),
            )
            .await;

        let stats = self.pool.stats();
        tracing::info!(
            active = stats.active,
            queued = stats.queued,
            open_connections = self.tracker.open_count(),
            grace_ms = self.config.pool.shutdown_grace_ms,
            "Draining connections"
        );
        let report = self.pool.shutdown().await;
        tracing::info!(
            drained = report.drained,
            cancelled = report.cancelled,
            completed = self.pool.stats().completed,
            rejected = self.pool.stats().rejected,
            "Proxy server stopped"
        );

        for task in background {
            task.abort();
        }
        report
    }
}

fn spawn_idle_eviction(
    context: Arc<ProxyContext>,
    every: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => context.connector.evict_idle(),
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}
