//! End-to-end flows through a running proxy.

mod common;

use std::time::Duration;

use common::{
    body_of, exchange, open_tunnel, plaintext_only, spawn_http_origin, spawn_https_origin,
    tls_connect, TestProxy,
};
use mitmlog_proxy::RoutePolicy;
use mitmlog_storage::Database;
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[tokio::test]
async fn direct_request_is_logged_and_forwarded() {
    let origin = spawn_http_origin().await;
    let proxy = TestProxy::start(RoutePolicy::default()).await;

    let stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let mut stream = BufReader::new(stream);
    let request = format!(
        "GET http://{origin}/direct?q=1 HTTP/1.1\r\nHost: {origin}\r\nX-Test: One\r\n\r\n"
    );

    let response = exchange(&mut stream, &request, "GET").await;
    assert_eq!(response.status, 200);
    assert_eq!(body_of(&response), "GET /direct?q=1");

    let rows = proxy.db.get_recent_requests(10, 0).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source_ip, "127.0.0.1");
    assert_eq!(rows[0].method, "GET");
    assert_eq!(rows[0].host, origin.to_string());
    assert_eq!(rows[0].url, format!("http://{origin}/direct?q=1"));
    assert_eq!(rows[0].headers, format!("host: {origin}\nx-test: One"));
}

#[tokio::test]
async fn non_proxy_request_is_answered_and_not_logged() {
    let proxy = TestProxy::start(RoutePolicy::default()).await;

    let stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let mut stream = BufReader::new(stream);

    let response = exchange(&mut stream, "GET / HTTP/1.1\r\nHost: proxy\r\n\r\n", "GET").await;
    assert_eq!(response.status, 500);
    assert!(body_of(&response).contains("This is a proxy server"));
    assert_eq!(proxy.db.count_requests().unwrap(), 0);
}

#[tokio::test]
async fn mitm_session_logs_decrypted_request() {
    let origin = spawn_https_origin().await;
    let proxy = TestProxy::start(RoutePolicy::default()).await;

    let (head, stream) = open_tunnel(proxy.addr(), &origin.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got {head:?}");

    let tls = tls_connect(stream, proxy.root_der(), "127.0.0.1").await;
    let mut tls = BufReader::new(tls);

    let response = exchange(
        &mut tls,
        "GET /secret HTTP/1.1\r\nHost: 127.0.0.1\r\nUser-Agent: flows\r\n\r\n",
        "GET",
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(body_of(&response), "GET /secret");

    // Same tunnel, second request
    let response = exchange(
        &mut tls,
        "POST /again HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 3\r\n\r\nabc",
        "POST",
    )
    .await;
    assert_eq!(body_of(&response), "POST /again");

    let rows = proxy.db.get_recent_requests(10, 0).unwrap();
    assert_eq!(rows.len(), 2);

    let first = &rows[1];
    assert_eq!(first.method, "GET");
    assert_eq!(first.host, "127.0.0.1");
    assert_eq!(first.url, "/secret");
    assert_eq!(first.source_ip, "127.0.0.1");
    assert_eq!(first.headers, "host: 127.0.0.1\nuser-agent: flows");

    assert_eq!(rows[0].method, "POST");
    assert_eq!(rows[0].url, "/again");
}

#[tokio::test]
async fn repeated_mitm_sessions_reuse_one_certificate() {
    let origin = spawn_https_origin().await;
    let proxy = TestProxy::start(RoutePolicy::default()).await;

    for _ in 0..3 {
        let (head, stream) = open_tunnel(proxy.addr(), &origin.to_string()).await;
        assert!(head.starts_with("HTTP/1.1 200"));

        let tls = tls_connect(stream, proxy.root_der(), "127.0.0.1").await;
        let mut tls = BufReader::new(tls);
        let response = exchange(
            &mut tls,
            "GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
            "GET",
        )
        .await;
        assert_eq!(response.status, 200);
    }

    assert_eq!(proxy.authority.issued_count(), 1);
    assert_eq!(proxy.db.count_requests().unwrap(), 3);
}

#[tokio::test]
async fn plaintext_tunnel_relays_requests_in_order() {
    let origin = spawn_http_origin().await;
    let proxy = TestProxy::start(plaintext_only(origin)).await;

    let (head, stream) = open_tunnel(proxy.addr(), &origin.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got {head:?}");

    let mut stream = BufReader::new(stream);
    let mut bodies = Vec::new();
    for path in ["/1", "/2", "/3"] {
        let request = format!("GET {path} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
        let response = exchange(&mut stream, &request, "GET").await;
        bodies.push(body_of(&response));
    }

    assert_eq!(bodies, vec!["GET /1", "GET /2", "GET /3"]);
    assert_eq!(proxy.authority.issued_count(), 0);
}

#[tokio::test]
async fn default_routes_relay_port_80_before_mitm() {
    let policy = RoutePolicy::default();
    assert_eq!(policy.classify("example.com:80"), mitmlog_proxy::Route::Plaintext);
    assert_eq!(policy.classify("example.com:443"), mitmlog_proxy::Route::Mitm);
}

#[tokio::test]
async fn unreachable_plaintext_target_gets_500() {
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = closed.local_addr().unwrap();
    drop(closed);

    let proxy = TestProxy::start(plaintext_only(target)).await;
    let (head, _stream) = open_tunnel(proxy.addr(), &target.to_string()).await;

    assert!(head.starts_with("HTTP/1.1 500"), "got {head:?}");
}

#[tokio::test]
async fn unroutable_target_is_refused() {
    let origin = spawn_http_origin().await;
    let proxy = TestProxy::start(plaintext_only(origin)).await;

    let (head, _stream) = open_tunnel(proxy.addr(), "example.com:443").await;
    assert!(head.starts_with("HTTP/1.1 502"), "got {head:?}");
}

#[tokio::test]
async fn malformed_target_is_rejected() {
    let proxy = TestProxy::start(RoutePolicy::default()).await;

    let (head, _stream) = open_tunnel(proxy.addr(), "example.com:0").await;
    assert!(head.starts_with("HTTP/1.1 400"), "got {head:?}");
}

#[tokio::test]
async fn read_only_log_still_forwards() {
    let origin = spawn_http_origin().await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log.db");
    let db = Database::with_path(&path).unwrap();
    let read_only = Database::open_read_only(&path).unwrap();
    let proxy = TestProxy::start_with(dir, read_only, db, RoutePolicy::default()).await;

    let stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let mut stream = BufReader::new(stream);
    let request = format!("GET http://{origin}/still HTTP/1.1\r\nHost: {origin}\r\n\r\n");

    let response = exchange(&mut stream, &request, "GET").await;
    assert_eq!(response.status, 200);
    assert_eq!(body_of(&response), "GET /still");
    assert_eq!(proxy.db.count_requests().unwrap(), 0);
}

#[tokio::test]
async fn stop_drains_idle_connections() {
    let origin = spawn_http_origin().await;
    let https_origin = spawn_https_origin().await;
    let proxy = TestProxy::start(RoutePolicy::default()).await;
    let addr = proxy.addr();

    // Idle keep-alive connection
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut direct = BufReader::new(stream);
    let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    exchange(&mut direct, &request, "GET").await;

    // Idle MITM tunnel
    let (_, stream) = open_tunnel(addr, &https_origin.to_string()).await;
    let tls = tls_connect(stream, proxy.root_der(), "127.0.0.1").await;
    let mut tunnel = BufReader::new(tls);
    exchange(&mut tunnel, "GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n", "GET").await;

    assert!(proxy.handle.active_connections() >= 2);

    tokio::time::timeout(Duration::from_secs(5), proxy.handle.stop())
        .await
        .expect("proxy did not drain");

    assert!(TcpStream::connect(addr).await.is_err());
    let _ = direct.get_mut().shutdown().await;
}
