//! Integration tests for the HTTP connection pool and pooled session,
//! driven against in-process fixture servers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use aqueduct::{
    codes, stage, BodyKind, HttpConnectionPool, HttpRequest, Origin, PoolConfig, PooledSession,
    ProxySetting,
};

fn pool_config(overrides: serde_json::Value) -> PoolConfig {
    serde_json::from_value(overrides).expect("pool config")
}

fn proxy_setting(host: &str, port: u16) -> ProxySetting {
    serde_json::from_value(serde_json::json!({
        "host": host, "port": port, "username": "", "password": ""
    }))
    .expect("proxy setting")
}

fn find_double_crlf(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(3)).find(|&i| &data[i..i + 4] == b"\r\n\r\n")
}

/// Minimal HTTP/1.1 fixture server. `respond` maps a request head to raw
/// response bytes; an empty response closes the connection without
/// writing. Returns the bound address and an accepted-connection counter.
async fn spawn_server<F>(respond: F) -> (std::net::SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(&str) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fixture server");
    let addr = listener.local_addr().expect("local addr");
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepts);
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let mut buf: Vec<u8> = Vec::new();
                let mut tmp = [0u8; 4096];
                loop {
                    let head_end = loop {
                        if let Some(pos) = find_double_crlf(&buf) {
                            break pos;
                        }
                        match socket.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    buf.drain(..head_end + 4);

                    let response = respond(&head);
                    if response.is_empty() {
                        return; // slam the connection shut
                    }
                    if socket.write_all(&response).await.is_err() {
                        return;
                    }
                    let closing = String::from_utf8_lossy(&response)
                        .to_ascii_lowercase()
                        .contains("connection: close");
                    if closing {
                        return;
                    }
                }
            });
        }
    });

    (addr, accepts)
}

fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

#[tokio::test]
#[serial]
async fn keep_alive_reuses_a_single_connection() {
    let (addr, accepts) = spawn_server(|_| ok_response("hello")).await;
    let pool = HttpConnectionPool::new(PoolConfig::default(), None);
    let origin = Origin::http("127.0.0.1", addr.port());

    for _ in 0..2 {
        let (response, code) =
            PooledSession::new(Arc::clone(&pool), origin.clone(), HttpRequest::get("/"))
                .run()
                .await;
        assert_eq!(code, stage::OK);
        let response = response.expect("response");
        assert_eq!(response.status, 200);
        assert_eq!(response.text().expect("utf8"), "hello");
    }

    // the second exchange rode the idle connection
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert_eq!(pool.idle_count(), 1);
    pool.stop().await;
    assert_eq!(pool.idle_count(), 0);
}

#[tokio::test]
#[serial]
async fn connection_close_prevents_reuse() {
    let (addr, accepts) = spawn_server(|_| {
        b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok".to_vec()
    })
    .await;
    let pool = HttpConnectionPool::new(PoolConfig::default(), None);
    let origin = Origin::http("127.0.0.1", addr.port());

    for _ in 0..2 {
        let (response, code) =
            PooledSession::new(Arc::clone(&pool), origin.clone(), HttpRequest::get("/"))
                .run()
                .await;
        assert_eq!(code, stage::OK);
        assert!(!response.expect("response").keep_alive());
    }

    assert_eq!(accepts.load(Ordering::SeqCst), 2);
    assert_eq!(pool.idle_count(), 0);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn idle_deque_is_lifo_and_capped_per_origin() {
    let (addr, _accepts) = spawn_server(|_| ok_response("x")).await;
    let config = pool_config(serde_json::json!({
        "max_idle_per_origin": 2,
        "idle_reap_interval": 0
    }));
    let pool = HttpConnectionPool::new(config, None);
    let origin = Origin::http("127.0.0.1", addr.port());

    let c1 = pool.acquire(&origin).await.expect("c1");
    let c2 = pool.acquire(&origin).await.expect("c2");
    let c3 = pool.acquire(&origin).await.expect("c3");
    let (id2, id3) = (c2.id(), c3.id());

    pool.release(c1, true).await;
    pool.release(c2, true).await;
    pool.release(c3, true).await; // evicts c1, the oldest

    assert_eq!(pool.idle_count(), 2);
    let first = pool.acquire(&origin).await.expect("reacquire");
    assert_eq!(first.id(), id3, "most recently released comes back first");
    let second = pool.acquire(&origin).await.expect("reacquire 2");
    assert_eq!(second.id(), id2);
    assert_eq!(pool.idle_count(), 0);

    pool.release(first, true).await;
    pool.release(second, true).await;
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn global_cap_victimizes_the_largest_deque() {
    let (addr_a, _) = spawn_server(|_| ok_response("a")).await;
    let (addr_b, _) = spawn_server(|_| ok_response("b")).await;
    let config = pool_config(serde_json::json!({
        "max_idle_per_origin": 6,
        "max_total_idle": 2,
        "idle_reap_interval": 0
    }));
    let pool = HttpConnectionPool::new(config, None);
    let origin_a = Origin::http("127.0.0.1", addr_a.port());
    let origin_b = Origin::http("127.0.0.1", addr_b.port());

    let a1 = pool.acquire(&origin_a).await.expect("a1");
    let a2 = pool.acquire(&origin_a).await.expect("a2");
    let b1 = pool.acquire(&origin_b).await.expect("b1");

    pool.release(a1, true).await;
    pool.release(a2, true).await;
    assert_eq!(pool.idle_count(), 2);
    // pushing a third idle breaches the global cap; the larger deque (A) pays
    pool.release(b1, true).await;
    assert_eq!(pool.idle_count(), 2);

    let got_b = pool.acquire(&origin_b).await.expect("b still idle");
    assert_eq!(got_b.origin(), &origin_b);
    pool.release(got_b, true).await;
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn reaper_prunes_expired_idle_connections() {
    let (addr, _accepts) = spawn_server(|_| ok_response("x")).await;
    let config = pool_config(serde_json::json!({
        "idle_keep_alive": 0,
        "idle_reap_interval": 1
    }));
    let pool = HttpConnectionPool::new(config, None);
    let origin = Origin::http("127.0.0.1", addr.port());

    let conn = pool.acquire(&origin).await.expect("conn");
    pool.release(conn, true).await;
    assert_eq!(pool.idle_count(), 1);

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(pool.idle_count(), 0, "reaper closed the expired connection");
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn proxy_connect_rejection_fails_at_the_proxy_status_stage() {
    let (proxy_addr, accepts) = spawn_server(|head| {
        assert!(head.starts_with("CONNECT "), "expected CONNECT, got: {head}");
        b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_vec()
    })
    .await;
    let pool = HttpConnectionPool::new(PoolConfig::default(), None);
    let destination = Origin::https("blocked.example.com", 443);

    let (response, code) = PooledSession::new(
        Arc::clone(&pool),
        destination,
        HttpRequest::get("/secret"),
    )
    .with_proxy(proxy_setting("127.0.0.1", proxy_addr.port()))
    .run()
    .await;

    assert!(response.is_none());
    assert_eq!(code, stage::PROXY_STATUS);
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert_eq!(pool.idle_count(), 0, "tunnel connection was closed");
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn proxy_tunnel_without_tls_context_fails_at_upgrade() {
    let (proxy_addr, _) = spawn_server(|head| {
        assert!(head.starts_with("CONNECT "));
        b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec()
    })
    .await;
    // no TLS context supplied: the upgrade step cannot proceed
    let pool = HttpConnectionPool::new(PoolConfig::default(), None);
    let destination = Origin::https("tunnel.example.com", 443);

    let (response, code) = PooledSession::new(
        Arc::clone(&pool),
        destination,
        HttpRequest::get("/"),
    )
    .with_proxy(proxy_setting("127.0.0.1", proxy_addr.port()))
    .run()
    .await;

    assert!(response.is_none());
    assert_eq!(code, stage::UPGRADE);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn chunked_bodies_are_reassembled() {
    let (addr, _) = spawn_server(|_| {
        b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
            .to_vec()
    })
    .await;
    let pool = HttpConnectionPool::new(PoolConfig::default(), None);
    let origin = Origin::http("127.0.0.1", addr.port());

    let (response, code) =
        PooledSession::new(Arc::clone(&pool), origin, HttpRequest::get("/stream"))
            .run()
            .await;
    assert_eq!(code, stage::OK);
    assert_eq!(response.expect("response").text().expect("utf8"), "hello world");
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn file_bodies_stream_to_disk() {
    let (addr, _) = spawn_server(|_| ok_response("file-content")).await;
    let pool = HttpConnectionPool::new(PoolConfig::default(), None);
    let origin = Origin::http("127.0.0.1", addr.port());
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("download.bin");

    let (response, code) =
        PooledSession::new(Arc::clone(&pool), origin, HttpRequest::get("/file"))
            .with_body_kind(BodyKind::file(&path))
            .run()
            .await;
    assert_eq!(code, stage::OK);
    let response = response.expect("response");
    assert_eq!(response.file_bytes, Some(12));
    assert!(response.body.is_empty());
    assert_eq!(std::fs::read(&path).expect("read back"), b"file-content");
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn oversized_text_body_fails_the_read_stage() {
    let (addr, _) = spawn_server(|_| ok_response("too large for the cap")).await;
    let pool = HttpConnectionPool::new(PoolConfig::default(), None);
    let origin = Origin::http("127.0.0.1", addr.port());

    let (response, code) =
        PooledSession::new(Arc::clone(&pool), origin, HttpRequest::get("/big"))
            .with_body_kind(BodyKind::Text { limit: 4 })
            .run()
            .await;
    assert!(response.is_none());
    assert_eq!(code, stage::RESPONSE_READ);
    assert_eq!(pool.idle_count(), 0, "failed exchange does not re-idle");
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn io_adapter_reports_stage_coded_errors() {
    // server accepts and closes without answering
    let (addr, _) = spawn_server(|_| Vec::new()).await;
    let config = pool_config(serde_json::json!({"io_timeout": 2}));
    let pool = HttpConnectionPool::new(config, None);
    let origin = Origin::http("127.0.0.1", addr.port());

    let err = PooledSession::new(Arc::clone(&pool), origin.clone(), HttpRequest::get("/"))
        .io()
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::http_stage::BASE + stage::RESPONSE_READ);
    assert!(err.what.contains("response read"));
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn stopped_pool_refuses_acquire() {
    let (addr, _) = spawn_server(|_| ok_response("x")).await;
    let pool = HttpConnectionPool::new(PoolConfig::default(), None);
    let origin = Origin::http("127.0.0.1", addr.port());

    pool.stop().await;
    let err = pool.acquire(&origin).await.unwrap_err();
    assert_eq!(err.code, codes::network::CONNECTION_REFUSED);
    assert!(err.what.contains("stopped"));

    let err = pool.acquire_io(origin).run().await.unwrap_err();
    assert_eq!(err.code, codes::network::CONNECTION_REFUSED);
}
