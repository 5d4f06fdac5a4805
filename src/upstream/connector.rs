//! Outbound connections to origin servers.
//!
//! # Responsibilities
//! - Reuse parked connections when pooling is enabled
//! - Resolve host names, bounded by the connect timeout
//! - Connect with a deadline and classify failures
//!
//! # Design Decisions
//! - One deadline covers resolution plus every address attempt
//! - Refused/unreachable → 502, deadline exceeded → 504

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::{TimeoutConfig, UpstreamConfig};
use crate::error::ProxyError;
use crate::observability::metrics;
use crate::upstream::pool::IdlePool;

/// A connection to an origin, owned by one handler at a time.
#[derive(Debug)]
pub struct UpstreamConn {
    pub stream: TcpStream,
    host: String,
    port: u16,
    reused: bool,
}

impl UpstreamConn {
    /// Whether this connection came out of the idle pool.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port)
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Opens (or reuses) connections to origins.
#[derive(Debug)]
pub struct Connector {
    connect_timeout: Duration,
    idle: Option<IdlePool>,
}

impl Connector {
    pub fn new(upstream: &UpstreamConfig, timeouts: &TimeoutConfig) -> Self {
        let idle = upstream
            .pool_enabled
            .then(|| IdlePool::new(upstream.max_idle_per_host, upstream.idle_stale()));
        Self {
            connect_timeout: timeouts.connect(),
            idle,
        }
    }

    /// Connection for an HTTP exchange: a parked one if available, else new.
    pub async fn connect(&self, host: &str, port: u16) -> Result<UpstreamConn, ProxyError> {
        if let Some(stream) = self.idle.as_ref().and_then(|pool| pool.checkout(host, port)) {
            tracing::debug!(upstream = %format_authority(host, port), "Reusing idle upstream connection");
            metrics::record_upstream_connect(true);
            return Ok(UpstreamConn {
                stream,
                host: host.to_string(),
                port,
                reused: true,
            });
        }
        self.open(host, port).await
    }

    /// A brand-new connection, bypassing the idle pool (tunnels, retries).
    pub async fn open(&self, host: &str, port: u16) -> Result<UpstreamConn, ProxyError> {
        let authority = format_authority(host, port);
        let deadline = Instant::now() + self.connect_timeout;
        let addrs = self.resolve(host, port, deadline, &authority).await?;

        let mut last_err = None;
        for addr in addrs {
            match timeout_at(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "Failed to set TCP_NODELAY upstream");
                    }
                    tracing::debug!(upstream = %authority, address = %addr, "Connected upstream");
                    metrics::record_upstream_connect(false);
                    return Ok(UpstreamConn {
                        stream,
                        host: host.to_string(),
                        port,
                        reused: false,
                    });
                }
                Ok(Err(e)) => {
                    tracing::debug!(upstream = %authority, address = %addr, error = %e, "Upstream connect failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    return Err(ProxyError::UpstreamUnreachable {
                        authority,
                        timed_out: true,
                        source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    });
                }
            }
        }

        Err(ProxyError::UpstreamUnreachable {
            authority,
            timed_out: false,
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no address tried")),
        })
    }

    /// Hand a finished connection back for reuse.
    pub fn release(&self, conn: UpstreamConn) {
        let Some(pool) = &self.idle else {
            return;
        };
        if !pool.checkin(&conn.host, conn.port, conn.stream) {
            tracing::trace!(upstream = %format_authority(&conn.host, conn.port), "Idle pool full, closing connection");
        }
    }

    pub fn pooling_enabled(&self) -> bool {
        self.idle.is_some()
    }

    /// Drop stale parked connections.
    pub fn evict_idle(&self) {
        if let Some(pool) = &self.idle {
            pool.evict_stale();
        }
    }

    pub fn idle_count(&self, host: &str, port: u16) -> usize {
        self.idle
            .as_ref()
            .map(|pool| pool.idle_count(host, port))
            .unwrap_or(0)
    }

    async fn resolve(
        &self,
        host: &str,
        port: u16,
        deadline: Instant,
        authority: &str,
    ) -> Result<Vec<SocketAddr>, ProxyError> {
        let unresolvable = |reason: String| ProxyError::UpstreamUnresolvable {
            authority: authority.to_string(),
            reason,
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let addrs: Vec<SocketAddr> = match timeout(remaining, tokio::net::lookup_host((host, port))).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => return Err(unresolvable(e.to_string())),
            Err(_) => return Err(unresolvable("resolution timed out".to_string())),
        };
        if addrs.is_empty() {
            return Err(unresolvable("no addresses".to_string()));
        }
        Ok(addrs)
    }
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn connector(pool_enabled: bool) -> Connector {
        let upstream = UpstreamConfig {
            pool_enabled,
            ..UpstreamConfig::default()
        };
        let timeouts = TimeoutConfig {
            connect_ms: 1_000,
            ..TimeoutConfig::default()
        };
        Connector::new(&upstream, &timeouts)
    }

    /// Accepts connections and keeps them open.
    async fn holding_origin() -> (SocketAddr, Arc<Mutex<Vec<TcpStream>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let held = Arc::new(Mutex::new(Vec::new()));
        let sink = held.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                sink.lock().unwrap().push(stream);
            }
        });
        (addr, held)
    }

    #[tokio::test]
    async fn connects_then_reuses_released_connection() {
        let (addr, _held) = holding_origin().await;
        let connector = connector(true);

        let conn = connector.connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(conn.authority(), format!("127.0.0.1:{}", addr.port()));
        let local = conn.stream.local_addr().unwrap();

        connector.release(conn);
        assert_eq!(connector.idle_count("127.0.0.1", addr.port()), 1);

        let again = connector.connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(again.is_reused());
        assert_eq!(again.stream.local_addr().unwrap(), local);

        connector.release(again);
        let fresh = connector.open("127.0.0.1", addr.port()).await.unwrap();
        assert!(!fresh.is_reused());
        assert_eq!(connector.idle_count("127.0.0.1", addr.port()), 1);
    }

    #[tokio::test]
    async fn release_without_pool_closes() {
        let (addr, _held) = holding_origin().await;
        let connector = connector(false);
        let conn = connector.connect("127.0.0.1", addr.port()).await.unwrap();
        connector.release(conn);
        assert_eq!(connector.idle_count("127.0.0.1", addr.port()), 0);
        let next = connector.connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(!next.is_reused());
    }

    #[tokio::test]
    async fn refused_connection_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connector(true).connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::UpstreamUnreachable { timed_out: false, .. }
        ));
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn unknown_host_is_unresolvable() {
        let err = connector(true)
            .connect("no-such-host.invalid", 80)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnresolvable { .. }));
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn brackets_ipv6_authorities() {
        assert_eq!(format_authority("::1", 8080), "[::1]:8080");
        assert_eq!(format_authority("example.com", 80), "example.com:80");
    }
}
