//! Failure injection: misbehaving origins and clients.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

mod common;

use common::{proxy_config, read_response, send_raw, start_proxy};

/// Origin that reads one request per connection, writes `response` and
/// closes, whatever the response headers promise.
async fn start_one_shot_origin(response: &'static [u8]) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let count = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response).await;
            });
        }
    });
    (addr, connections)
}

#[tokio::test]
async fn test_garbage_response_is_bad_gateway() {
    let (origin, _) = start_one_shot_origin(b"this is not http\r\n\r\n").await;
    let proxy = start_proxy(proxy_config()).await;

    let request = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", origin.port());
    let reply = send_raw(proxy.addr, request.as_bytes()).await;
    assert!(reply.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_slow_origin_hits_request_timeout() {
    let (silent, _held) = common::start_silent_server().await;
    let mut config = proxy_config();
    config.timeouts.request_ms = 300;
    let proxy = start_proxy(config).await;

    let request = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", silent.port());
    let reply = send_raw(proxy.addr, request.as_bytes()).await;
    assert!(reply.starts_with(b"HTTP/1.1 504 Gateway Timeout\r\n"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_truncated_body_closes_client() {
    let (origin, _) =
        start_one_shot_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").await;
    let proxy = start_proxy(proxy_config()).await;

    let request = format!("GET http://127.0.0.1:{}/partial HTTP/1.1\r\n\r\n", origin.port());
    let reply = send_raw(proxy.addr, request.as_bytes()).await;
    // Headers were already sent; the only signal left is the close.
    assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(reply.ends_with(b"\r\n\r\nabc"));

    // Nothing partial was stored.
    let again = send_raw(proxy.addr, request.as_bytes()).await;
    assert!(again.ends_with(b"\r\n\r\nabc"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_stale_pooled_connection_is_replaced() {
    // Promises keep-alive but closes after every response.
    let (origin, connections) =
        start_one_shot_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let mut config = proxy_config();
    config.cache.enabled = false;
    let proxy = start_proxy(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", origin.port());
    for _ in 0..2 {
        client.write_all(request.as_bytes()).await.unwrap();
        let reply = read_response(&mut client).await;
        assert!(reply.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with(b"ok"));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    drop(client);
    proxy.stop().await;
}

#[tokio::test]
async fn test_origin_form_without_host_is_bad_request() {
    let proxy = start_proxy(proxy_config()).await;
    let reply = send_raw(proxy.addr, b"GET /index.html HTTP/1.1\r\n\r\n").await;
    assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_client_vanishing_mid_request_is_survived() {
    let origin = common::start_mock_backend("still here").await;
    let proxy = start_proxy(proxy_config()).await;

    {
        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        client
            .write_all(b"POST http://127.0.0.1:1/ HTTP/1.1\r\nContent-Length: 100\r\n\r\npart")
            .await
            .unwrap();
    }

    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nConnection: close\r\n\r\n",
        origin.port()
    );
    let reply = send_raw(proxy.addr, request.as_bytes()).await;
    assert!(reply.ends_with(b"still here"));

    let report = proxy.stop().await;
    assert!(report.drained);
}
