//! Accepted client connection as a unit of pool work.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;

use crate::net::ConnectionGuard;
use crate::pool::Task;
use crate::proxy::context::ProxyContext;
use crate::proxy::handler::ConnectionHandler;

/// An accepted connection waiting for (or running on) a worker.
///
/// Dropping it unrun closes the socket without writing anything.
#[derive(Debug)]
pub struct ClientTask {
    stream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
    context: Arc<ProxyContext>,
    accepted_at: Instant,
}

impl ClientTask {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        guard: ConnectionGuard,
        context: Arc<ProxyContext>,
    ) -> Self {
        Self {
            stream,
            peer,
            guard,
            context,
            accepted_at: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Task for ClientTask {
    fn run(self) -> impl Future<Output = ()> + Send + 'static {
        async move {
            let queued_ms = self.accepted_at.elapsed().as_millis() as u64;
            let handler = ConnectionHandler::new(self.context, self.guard.id(), self.peer);
            tracing::trace!(connection_id = %self.guard.id(), queued_ms, "Worker picked up connection");
            handler.run(self.stream).await;
            drop(self.guard);
        }
    }
}
