//! Per-connection state machine.
//!
//! # Responsibilities
//! - Read requests from one client connection, one after another
//! - Answer from the cache or forward to the origin and relay the response
//! - Tunnel CONNECT requests for the rest of the connection
//! - Turn failures into error responses while nothing has been sent yet
//!
//! # Design Decisions
//! - Every exchange gets a fresh request ID and its own tracing span
//! - Upstream connections are taken per exchange and parked again only when
//!   the response ended exactly on its framing boundary
//! - A reused upstream connection that dies before answering is retried
//!   once on a fresh connection; nothing has reached the client by then

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::{request_is_cacheable, response_ttl, CacheKey};
use crate::error::{error_response, ProxyError};
use crate::net::ConnectionId;
use crate::observability::metrics;
use crate::proto::response::read_response_head;
use crate::proto::{Request, RequestParser, ResponseHead};
use crate::proxy::context::ProxyContext;
use crate::relay::{self, BodyCapture};
use crate::upstream::UpstreamConn;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reading,
    Resolving,
    Forwarding,
    Relaying,
    Closing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Reading => "reading",
            Phase::Resolving => "resolving",
            Phase::Forwarding => "forwarding",
            Phase::Relaying => "relaying",
            Phase::Closing => "closing",
        }
    }
}

/// What the client has seen of the current exchange.
#[derive(Debug, Default)]
struct Progress {
    /// Any response byte has been written; no error response may follow.
    responded: bool,
    status: u16,
    upstream: Option<String>,
    cache_hit: bool,
}

/// Serves one client connection until it closes.
pub struct ConnectionHandler {
    context: Arc<ProxyContext>,
    id: ConnectionId,
    peer: SocketAddr,
    phase: Phase,
}

impl ConnectionHandler {
    pub fn new(context: Arc<ProxyContext>, id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            context,
            id,
            peer,
            phase: Phase::Reading,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Serve `stream` to completion, bounded by the connection lifetime.
    pub async fn run(mut self, stream: TcpStream) {
        let span = tracing::info_span!("connection", id = %self.id, peer = %self.peer);
        let lifetime = self.context.timeouts.connection();
        async move {
            tracing::debug!("Connection started");
            match timeout(lifetime, self.serve(stream)).await {
                Ok(Ok(())) => tracing::debug!("Connection closed"),
                Ok(Err(e)) => log_failure(&e, self.phase),
                Err(_) => tracing::info!(
                    lifetime_ms = lifetime.as_millis() as u64,
                    phase = self.phase.as_str(),
                    "Connection lifetime exceeded"
                ),
            }
            self.phase = Phase::Closing;
        }
        .instrument(span)
        .await
    }

    async fn serve(&mut self, mut client: TcpStream) -> Result<(), ProxyError> {
        let idle = self.context.timeouts.idle();
        let exchange_budget = self.context.timeouts.request();
        let mut parser = RequestParser::new(self.context.parser_limits());

        loop {
            self.phase = Phase::Reading;
            let request = match parser.read_request(&mut client, idle).await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(ProxyError::IdleTimeout(_)) if parser.is_idle() => {
                    tracing::debug!("Keep-alive connection idle, closing");
                    return Ok(());
                }
                Err(e) => {
                    reject(&mut client, &e).await;
                    return Err(e);
                }
            };

            let request_id = Uuid::new_v4();
            let span = tracing::info_span!(
                "request",
                id = %request_id,
                method = %request.method,
                target = %request.raw_target,
            );

            if request.is_connect() {
                let early = parser.take_buffered();
                return self.tunnel(client, request, early).instrument(span).await;
            }

            let started = Instant::now();
            let mut progress = Progress::default();
            let outcome = timeout(
                exchange_budget,
                self.exchange(&mut client, &request, &mut progress),
            )
            .instrument(span.clone())
            .await
            .unwrap_or(Err(ProxyError::TotalTimeout(exchange_budget)));

            match outcome {
                Ok(keep_alive) => {
                    metrics::record_request(&request.method, progress.status, started);
                    tracing::info!(
                        parent: &span,
                        status = progress.status,
                        upstream = progress.upstream.as_deref().unwrap_or("-"),
                        cache_hit = progress.cache_hit,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Request completed"
                    );
                    if !keep_alive {
                        return Ok(());
                    }
                }
                Err(e) => {
                    if !progress.responded {
                        progress.status = e.status().map(|s| s.as_u16()).unwrap_or_default();
                        reject(&mut client, &e).await;
                    }
                    metrics::record_request(&request.method, progress.status, started);
                    tracing::debug!(parent: &span, status = progress.status, error = %e, "Request failed");
                    return Err(e);
                }
            }
        }
    }

    /// One request/response exchange. Returns whether the client connection
    /// stays open for another request.
    async fn exchange(
        &mut self,
        client: &mut TcpStream,
        request: &Request,
        progress: &mut Progress,
    ) -> Result<bool, ProxyError> {
        let idle = self.context.timeouts.idle();
        let client_keep_alive = request.wants_keep_alive();

        let cache = self.context.cache.clone();
        let cache_key = match &cache {
            Some(_) if request_is_cacheable(request) => CacheKey::for_request(request),
            _ => None,
        };
        if let (Some(cache), Some(key)) = (&cache, &cache_key) {
            if let Some(hit) = cache.lookup(key) {
                metrics::record_cache("hit");
                progress.responded = true;
                progress.cache_hit = true;
                progress.status = hit.head.status.as_u16();
                write_client(client, &hit.to_client_bytes(client_keep_alive), idle).await?;
                return Ok(client_keep_alive);
            }
            metrics::record_cache("miss");
        }

        self.phase = Phase::Resolving;
        let (host, port) = request
            .destination()
            .ok_or(ProxyError::MalformedRequest("no destination"))?;

        self.phase = Phase::Forwarding;
        let wire = request.to_upstream_bytes(self.context.connector.pooling_enabled());
        let (mut upstream, mut buf, mut head) = self.send(&host, port, &wire).await?;
        progress.upstream = Some(upstream.authority());

        self.phase = Phase::Relaying;
        while head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            progress.responded = true;
            write_client(client, &head.to_raw_bytes(), idle).await?;
            head = read_response_head(
                &mut upstream.stream,
                &mut buf,
                self.context.limits.max_response_header_bytes,
                idle,
            )
            .await?;
        }

        let framing = head.framing(&request.method)?;
        let keep_alive = client_keep_alive
            && head.is_persistent()
            && framing.is_delimited()
            && head.status != StatusCode::SWITCHING_PROTOCOLS;

        progress.responded = true;
        progress.status = head.status.as_u16();
        write_client(client, &head.to_client_bytes(keep_alive), idle).await?;

        let ttl = match (&cache, &cache_key) {
            (Some(cache), Some(_)) => response_ttl(&head, framing, cache.default_ttl()),
            _ => None,
        };
        let mut capture = match (&cache, ttl) {
            (Some(cache), Some(_)) => Some(BodyCapture::new(cache.max_entry_bytes())),
            _ => None,
        };

        let copied = relay::copy_body(
            &mut upstream.stream,
            &mut buf,
            client,
            framing,
            idle,
            capture.as_mut(),
        )
        .await?;
        tracing::trace!(bytes = copied.bytes, ?framing, "Response body relayed");

        let reusable = copied.clean && head.is_persistent();
        if let (Some(cache), Some(key), Some(ttl), Some(capture)) = (&cache, cache_key, ttl, capture) {
            if let Some(body) = capture.into_body() {
                if cache.insert(key, head, Bytes::from(body), ttl) {
                    metrics::record_cache("store");
                    tracing::debug!(ttl_ms = ttl.as_millis() as u64, "Response cached");
                }
            }
        }

        if reusable {
            self.context.connector.release(upstream);
        }
        Ok(keep_alive)
    }

    /// Write the request upstream and read the first response head.
    async fn send(
        &self,
        host: &str,
        port: u16,
        wire: &[u8],
    ) -> Result<(UpstreamConn, BytesMut, ResponseHead), ProxyError> {
        let connector = &self.context.connector;
        let upstream = connector.connect(host, port).await?;
        if !upstream.is_reused() {
            return self.send_on(upstream, wire).await;
        }
        match self.send_on(upstream, wire).await {
            Err(e) if is_stale_reuse(&e) => {
                tracing::debug!(error = %e, "Reused upstream connection failed, retrying on a fresh one");
                let fresh = connector.open(host, port).await?;
                self.send_on(fresh, wire).await
            }
            other => other,
        }
    }

    async fn send_on(
        &self,
        mut upstream: UpstreamConn,
        wire: &[u8],
    ) -> Result<(UpstreamConn, BytesMut, ResponseHead), ProxyError> {
        let idle = self.context.timeouts.idle();
        match timeout(idle, upstream.stream.write_all(wire)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProxyError::UpstreamIdle(idle)),
        }
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let head = read_response_head(
            &mut upstream.stream,
            &mut buf,
            self.context.limits.max_response_header_bytes,
            idle,
        )
        .await?;
        Ok((upstream, buf, head))
    }

    /// Serve a CONNECT request: the rest of the connection is a raw tunnel.
    async fn tunnel(
        &mut self,
        mut client: TcpStream,
        request: Request,
        early: Bytes,
    ) -> Result<(), ProxyError> {
        let started = Instant::now();
        self.phase = Phase::Resolving;
        let connected = match request.destination() {
            Some((host, port)) => self.context.connector.open(&host, port).await,
            None => Err(ProxyError::MalformedRequest("CONNECT without authority")),
        };
        let upstream = match connected {
            Ok(upstream) => upstream,
            Err(e) => {
                reject(&mut client, &e).await;
                let status = e.status().map(|s| s.as_u16()).unwrap_or_default();
                metrics::record_request(&Method::CONNECT, status, started);
                return Err(e);
            }
        };
        let authority = upstream.authority();
        let idle = self.context.timeouts.idle();

        self.phase = Phase::Forwarding;
        write_client(&mut client, CONNECT_ESTABLISHED, idle).await?;
        metrics::record_request(&Method::CONNECT, 200, started);
        let mut upstream = upstream.into_stream();
        if !early.is_empty() {
            upstream.write_all(&early).await?;
        }

        self.phase = Phase::Relaying;
        tracing::info!(upstream = %authority, "Tunnel established");
        let stats = relay::tunnel(client, upstream, idle).await?;
        tracing::info!(
            upstream = %authority,
            sent = stats.client_to_upstream + early.len() as u64,
            received = stats.upstream_to_client,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tunnel closed"
        );
        Ok(())
    }
}

async fn write_client<W>(client: &mut W, bytes: &[u8], idle: Duration) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    match timeout(idle, client.write_all(bytes)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if is_disconnect(&e) => Err(ProxyError::ClientClosed),
        Ok(Err(e)) => Err(ProxyError::RelayIo(e)),
        Err(_) => Err(ProxyError::IdleTimeout(idle)),
    }
}

/// Send the error response for `err`, if it has one. Best effort: the client
/// may already be gone.
async fn reject(client: &mut TcpStream, err: &ProxyError) {
    let Some(status) = err.status() else {
        return;
    };
    let body = format!("{err}\n");
    if let Err(e) = client.write_all(&error_response(status, &body)).await {
        tracing::trace!(error = %e, "Could not deliver error response");
        return;
    }
    let _ = client.shutdown().await;
}

fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(err.kind(), BrokenPipe | ConnectionReset | ConnectionAborted)
}

fn is_stale_reuse(err: &ProxyError) -> bool {
    match err {
        ProxyError::RelayIo(e) => is_disconnect(e),
        ProxyError::UpstreamProtocol(reason) => *reason == "upstream closed before responding",
        _ => false,
    }
}

fn log_failure(err: &ProxyError, phase: Phase) {
    match err {
        ProxyError::ClientClosed | ProxyError::IdleTimeout(_) => {
            tracing::debug!(error = %err, kind = err.kind(), phase = phase.as_str(), "Connection ended")
        }
        ProxyError::MalformedRequest(_) | ProxyError::RequestTooLarge(_) => {
            tracing::info!(error = %err, kind = err.kind(), phase = phase.as_str(), "Rejected client request")
        }
        _ => tracing::warn!(error = %err, kind = err.kind(), phase = phase.as_str(), "Connection failed"),
    }
}
