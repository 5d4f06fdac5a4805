//! TCP listener and accept loop.
//!
//! # Responsibilities
//! - Bind to the configured address with the configured backlog
//! - Accept incoming TCP connections and hand them to the worker pool
//! - Drop connections the pool cannot take, without writing anything
//! - Survive accept errors (fd exhaustion, aborted handshakes)

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};

use crate::config::ListenerConfig;
use crate::error::ProxyError;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::observability::metrics;
use crate::pool::{SubmitError, WorkerPool};
use crate::proxy::{ClientTask, ProxyContext};

/// Pause after a failed `accept()` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bound listening socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind to the configured address. Must be called within a Tokio runtime.
    pub fn bind(config: &ListenerConfig) -> Result<Self, ProxyError> {
        let address = config.bind_address.clone();
        let bind_error = |source: io::Error| ProxyError::Bind {
            address: address.clone(),
            source,
        };

        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| bind_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(&bind_error)?;
        socket.set_reuseaddr(true).map_err(&bind_error)?;
        socket.bind(addr).map_err(&bind_error)?;
        let inner = socket.listen(config.backlog).map_err(&bind_error)?;

        let local_addr = inner.local_addr().map_err(&bind_error)?;
        tracing::info!(address = %local_addr, backlog = config.backlog, "Listener bound");
        Ok(Self { inner })
    }

    /// Wrap an already bound listener.
    pub fn from_tcp(inner: TcpListener) -> Self {
        Self { inner }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept until shutdown, submitting every connection to `pool`.
    pub async fn run(
        self,
        pool: WorkerPool<ClientTask>,
        context: Arc<ProxyContext>,
        tracker: ConnectionTracker,
        shutdown: Shutdown,
    ) {
        let mut shutdown_rx = shutdown.subscribe();
        if shutdown.is_triggered() {
            return;
        }

        loop {
            let accepted = tokio::select! {
                accepted = self.inner.accept() => accepted,
                _ = shutdown_rx.recv() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer_addr = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let task = ClientTask::new(stream, peer, tracker.track(), Arc::clone(&context));
                    match pool.submit(task) {
                        Ok(()) => {
                            metrics::record_accepted();
                            tracing::trace!(peer_addr = %peer, "Connection admitted");
                        }
                        Err(err) => {
                            metrics::record_rejected();
                            let closed = matches!(err, SubmitError::Closed(_));
                            let reason = ProxyError::from(err);
                            tracing::debug!(peer_addr = %peer, closed, reason = %reason, "Connection rejected");
                        }
                    }
                }
                Err(e) => {
                    metrics::record_accept_error();
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        tracing::info!("Accept loop stopped");
    }
}
