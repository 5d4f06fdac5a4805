//! Byte relay between client and origin.
//!
//! # Responsibilities
//! - Tunnel raw bytes in both directions (CONNECT)
//! - Copy one framed response body from origin to client
//! - Enforce the idle window on every transfer
//!
//! # Design Decisions
//! - Both tunnel directions share one [`ActivityClock`]; the tunnel is idle
//!   only when neither side has moved a byte
//! - EOF on one side half-closes the other side's write half
//! - Bodies are forwarded verbatim; chunked framing is tracked, never decoded

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};

use crate::error::ProxyError;
use crate::proto::chunked::ChunkedScanner;
use crate::proto::response::Framing;

const RELAY_CHUNK: usize = 16 * 1024;

/// Last time any byte moved, shared by both directions of a tunnel.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }

    /// Resolve once nothing has moved for `idle`.
    pub async fn expired(&self, idle: Duration) {
        loop {
            let quiet = self.idle_for();
            if quiet >= idle {
                return;
            }
            tokio::time::sleep(idle - quiet).await;
        }
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes moved by a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relay bytes both ways until both sides have finished.
///
/// Both streams are consumed and closed when this returns.
pub async fn tunnel<C, U>(client: C, upstream: U, idle: Duration) -> Result<TunnelStats, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let clock = ActivityClock::new();
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let copy = async {
        tokio::try_join!(
            pump(&mut client_rd, &mut upstream_wr, &clock),
            pump(&mut upstream_rd, &mut client_wr, &clock),
        )
    };

    tokio::select! {
        result = copy => {
            let (client_to_upstream, upstream_to_client) = result?;
            Ok(TunnelStats { client_to_upstream, upstream_to_client })
        }
        _ = clock.expired(idle) => Err(ProxyError::IdleTimeout(idle)),
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, clock: &ActivityClock) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // The peer may already be gone; the other direction reports that.
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        clock.touch();
        writer.write_all(&buf[..n]).await?;
        clock.touch();
        total += n as u64;
    }
}

/// Collects a copy of a response body, up to a byte cap.
#[derive(Debug)]
pub struct BodyCapture {
    limit: usize,
    data: Vec<u8>,
    overflowed: bool,
}

impl BodyCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            data: Vec::new(),
            overflowed: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.data.len() + bytes.len() > self.limit {
            self.overflowed = true;
            self.data = Vec::new();
            return;
        }
        self.data.extend_from_slice(bytes);
    }

    /// The captured body, unless it outgrew the cap.
    pub fn into_body(self) -> Option<Vec<u8>> {
        (!self.overflowed).then_some(self.data)
    }
}

/// Result of copying one response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyCopy {
    /// Body bytes written to the client.
    pub bytes: u64,
    /// The body ended exactly at its framing boundary with nothing trailing,
    /// so the upstream connection can carry another exchange.
    pub clean: bool,
}

/// Copy one response body from `upstream` to `client` according to `framing`.
///
/// `buffered` holds bytes already read past the response head; it is drained
/// first. Each read and write must make progress within `idle`.
pub async fn copy_body<R, W>(
    upstream: &mut R,
    buffered: &mut BytesMut,
    client: &mut W,
    framing: Framing,
    idle: Duration,
    mut capture: Option<&mut BodyCapture>,
) -> Result<BodyCopy, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    match framing {
        Framing::Empty => {}
        Framing::Length(len) => {
            let mut remaining = len;
            loop {
                if !buffered.is_empty() && remaining > 0 {
                    let take = remaining.min(buffered.len() as u64) as usize;
                    let chunk = buffered.split_to(take);
                    forward(client, &chunk, idle, capture.as_deref_mut()).await?;
                    remaining -= take as u64;
                    written += take as u64;
                }
                if remaining == 0 {
                    break;
                }
                if fill(upstream, buffered, idle).await? == 0 {
                    return Err(ProxyError::UpstreamProtocol("upstream closed mid-body"));
                }
            }
        }
        Framing::Chunked => {
            let mut scanner = ChunkedScanner::new();
            loop {
                if !buffered.is_empty() {
                    let used = scanner.advance(&buffered[..])?;
                    let chunk = buffered.split_to(used);
                    forward(client, &chunk, idle, capture.as_deref_mut()).await?;
                    written += used as u64;
                }
                if scanner.is_done() {
                    break;
                }
                if fill(upstream, buffered, idle).await? == 0 {
                    return Err(ProxyError::UpstreamProtocol("upstream closed mid-body"));
                }
            }
        }
        Framing::UntilClose => loop {
            if !buffered.is_empty() {
                let chunk = buffered.split();
                forward(client, &chunk, idle, capture.as_deref_mut()).await?;
                written += chunk.len() as u64;
            }
            if fill(upstream, buffered, idle).await? == 0 {
                break;
            }
        },
    }

    timeout(idle, client.flush())
        .await
        .map_err(|_| ProxyError::IdleTimeout(idle))??;

    Ok(BodyCopy {
        bytes: written,
        clean: framing.is_delimited() && buffered.is_empty(),
    })
}

async fn fill<R>(upstream: &mut R, buf: &mut BytesMut, idle: Duration) -> Result<usize, ProxyError>
where
    R: AsyncRead + Unpin,
{
    buf.reserve(RELAY_CHUNK);
    match timeout(idle, upstream.read_buf(buf)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProxyError::IdleTimeout(idle)),
    }
}

async fn forward<W>(
    client: &mut W,
    chunk: &[u8],
    idle: Duration,
    capture: Option<&mut BodyCapture>,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    if let Some(capture) = capture {
        capture.push(chunk);
    }
    match timeout(idle, client.write_all(chunk)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProxyError::IdleTimeout(idle)),
    }
}
