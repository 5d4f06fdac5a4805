//! Idle upstream connection pool.

use std::io;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpStream;

type PoolKey = (String, u16);

#[derive(Debug)]
struct IdleConn {
    stream: TcpStream,
    parked_at: Instant,
}

/// Parked upstream connections, keyed by origin.
#[derive(Debug)]
pub struct IdlePool {
    conns: DashMap<PoolKey, Vec<IdleConn>>,
    max_per_host: usize,
    stale_after: Duration,
}

impl IdlePool {
    pub fn new(max_per_host: usize, stale_after: Duration) -> Self {
        Self {
            conns: DashMap::new(),
            max_per_host,
            stale_after,
        }
    }

    /// Take the most recently parked live connection for `host:port`.
    pub fn checkout(&self, host: &str, port: u16) -> Option<TcpStream> {
        let key = (host.to_ascii_lowercase(), port);
        let mut entry = self.conns.get_mut(&key)?;
        while let Some(idle) = entry.pop() {
            if idle.parked_at.elapsed() > self.stale_after {
                tracing::trace!(host, port, "Dropping stale idle connection");
                continue;
            }
            if !is_alive(&idle.stream) {
                tracing::trace!(host, port, "Dropping closed idle connection");
                continue;
            }
            return Some(idle.stream);
        }
        None
    }

    /// Park a connection. Returns `false` (and drops it) when the host is full.
    pub fn checkin(&self, host: &str, port: u16, stream: TcpStream) -> bool {
        if self.max_per_host == 0 {
            return false;
        }
        let key = (host.to_ascii_lowercase(), port);
        let mut entry = self.conns.entry(key).or_default();
        if entry.len() >= self.max_per_host {
            return false;
        }
        entry.push(IdleConn {
            stream,
            parked_at: Instant::now(),
        });
        true
    }

    pub fn idle_count(&self, host: &str, port: u16) -> usize {
        self.conns
            .get(&(host.to_ascii_lowercase(), port))
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// Drop every parked connection that is stale.
    pub fn evict_stale(&self) {
        let stale_after = self.stale_after;
        self.conns.retain(|_, conns| {
            conns.retain(|idle| idle.parked_at.elapsed() <= stale_after);
            !conns.is_empty()
        });
    }
}

/// An idle HTTP connection must have nothing to read: pending data or EOF
/// means the origin spoke out of turn or hung up.
fn is_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn reuses_live_connections_lifo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = IdlePool::new(4, Duration::from_secs(30));
        let (first, _s1) = pair(&listener).await;
        let (second, _s2) = pair(&listener).await;
        let second_local = second.local_addr().unwrap();

        assert!(pool.checkin("Origin", 80, first));
        assert!(pool.checkin("origin", 80, second));
        assert_eq!(pool.idle_count("origin", 80), 2);

        let reused = pool.checkout("origin", 80).unwrap();
        assert_eq!(reused.local_addr().unwrap(), second_local);
        assert_eq!(pool.idle_count("origin", 80), 1);
        assert!(pool.checkout("other", 80).is_none());
    }

    #[tokio::test]
    async fn respects_per_host_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = IdlePool::new(1, Duration::from_secs(30));
        let (a, _sa) = pair(&listener).await;
        let (b, _sb) = pair(&listener).await;
        assert!(pool.checkin("h", 1, a));
        assert!(!pool.checkin("h", 1, b));
        assert_eq!(pool.idle_count("h", 1), 1);
    }

    #[tokio::test]
    async fn skips_closed_and_stale_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = IdlePool::new(4, Duration::from_secs(30));
        let (client, mut server) = pair(&listener).await;
        assert!(pool.checkin("h", 1, client));
        server.shutdown().await.unwrap();
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.checkout("h", 1).is_none());

        let stale = IdlePool::new(4, Duration::from_millis(1));
        let (client, _server) = pair(&listener).await;
        assert!(stale.checkin("h", 1, client));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stale.checkout("h", 1).is_none());
    }

    #[tokio::test]
    async fn evict_stale_empties_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = IdlePool::new(4, Duration::from_millis(1));
        let (client, _server) = pair(&listener).await;
        assert!(pool.checkin("h", 1, client));
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.evict_stale();
        assert_eq!(pool.idle_count("h", 1), 0);
    }
}
