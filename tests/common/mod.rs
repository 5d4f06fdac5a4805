//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use web_proxy::config::ProxyConfig;
use web_proxy::lifecycle::Shutdown;
use web_proxy::net::Listener;
use web_proxy::pool::{ShutdownReport, WorkerPool};
use web_proxy::proxy::{ClientTask, ProxyServer};

/// A running proxy on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub pool: WorkerPool<ClientTask>,
    pub handle: JoinHandle<ShutdownReport>,
}

impl TestProxy {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// reqwest client that sends every http:// request through this proxy.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(self.url()).unwrap())
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    pub async fn stop(self) -> ShutdownReport {
        self.shutdown.trigger();
        self.handle.await.unwrap()
    }
}

/// Defaults tuned for tests: loopback bind, short timeouts.
pub fn proxy_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.pool.max_workers = 8;
    config.pool.queue_capacity = 16;
    config.pool.shutdown_grace_ms = 1_000;
    config.timeouts.connect_ms = 1_000;
    config.timeouts.idle_ms = 2_000;
    config.timeouts.request_ms = 5_000;
    config
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let listener = Listener::bind(&config.listener).unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server = ProxyServer::new(config);
    let pool = server.pool().clone();
    let handle = tokio::spawn(server.run(listener, shutdown.clone()));
    TestProxy {
        addr,
        shutdown,
        pool,
        handle,
    }
}

/// A mock origin server that records every request it receives.
pub struct Origin {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    connections: Arc<AtomicUsize>,
}

impl Origin {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Raw bytes (head and body) of every request so far.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Start an HTTP/1.1 origin. `respond` builds the full response bytes from
/// the raw request. Connections stay open unless the request asked to close.
pub async fn start_origin<F>(respond: F) -> Origin
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));
    let respond = Arc::new(respond);

    let (log, count) = (requests.clone(), connections.clone());
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            let (log, respond) = (log.clone(), respond.clone());
            tokio::spawn(async move {
                let mut pending = Vec::new();
                while let Some(request) = read_message(&mut socket, &mut pending).await {
                    log.lock().unwrap().push(request.clone());
                    let response = respond(&request);
                    if socket.write_all(&response).await.is_err() {
                        break;
                    }
                    if header_value(&request, "connection").as_deref() == Some("close") {
                        break;
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    Origin {
        addr,
        requests,
        connections,
    }
}

/// Origin answering every request with `200 OK` and `body`.
pub async fn start_mock_backend(body: &'static str) -> Origin {
    start_origin(move |_| ok_response(body, &[])).await
}

/// A raw TCP echo server (tunnel endpoint).
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    addr
}

/// A server that accepts and then never says anything.
pub async fn start_silent_server() -> (SocketAddr, Arc<Mutex<Vec<TcpStream>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let held = Arc::new(Mutex::new(Vec::new()));
    let sink = held.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            sink.lock().unwrap().push(socket);
        }
    });
    (addr, held)
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn ok_response(body: &str, extra_headers: &[(&str, &str)]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n", body.len());
    for (name, value) in extra_headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out.into_bytes()
}

/// Write `request` to the proxy and read until it closes the connection.
pub async fn send_raw(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    read_until_close(&mut stream).await
}

/// Everything the peer sends until EOF, a reset, or 5 seconds pass.
pub async fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            Err(_) => panic!("peer did not close within 5s"),
        }
    }
    out
}

/// Read one Content-Length framed response, leaving the connection open.
pub async fn read_response(stream: &mut TcpStream) -> Vec<u8> {
    let mut pending = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), read_message(stream, &mut pending))
        .await
        .expect("response within 5s")
        .expect("a complete response")
}

/// Read one message (head plus Content-Length body). Bytes past its end are
/// kept in `pending` for the next call.
async fn read_message(stream: &mut TcpStream, pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(head_end) = find(pending, b"\r\n\r\n").map(|i| i + 4) {
            let length = header_value(&pending[..head_end], "content-length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            if pending.len() >= head_end + length {
                let rest = pending.split_off(head_end + length);
                return Some(std::mem::replace(pending, rest));
            }
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
        }
    }
}

/// Lowercased value of the first `name` header in a raw message.
pub fn header_value(message: &[u8], name: &str) -> Option<String> {
    let head_end = find(message, b"\r\n\r\n").unwrap_or(message.len());
    let head = String::from_utf8_lossy(&message[..head_end]);
    head.lines().skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim()
            .eq_ignore_ascii_case(name)
            .then(|| v.trim().to_ascii_lowercase())
    })
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
