//! Integration tests for the HTTP surface and the WebSocket handshake.
//!
//! These run against a server bound to an ephemeral port with no
//! database and no broker behind it, which pins down exactly how far
//! each request gets before infrastructure is needed: the health
//! probe and CORS preflight answer on their own, a tokenless socket
//! is turned away before any pool work, and everything else fails
//! closed.

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use sproutd::config::Config;
use sproutd::db::ConnectionPool;
use sproutd::state::AppState;
use sproutd::ws::{CLOSE_DB_UNAVAILABLE, CLOSE_UNAUTHORIZED};

const TEST_SECRET: &str = "live-ws-secret";

fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".into(),
        listen_addr: "127.0.0.1:0".into(),
        pg_pool_min: 1,
        pg_pool_max: 2,
        mqtt_host: None,
        mqtt_port: 1883,
        jwt_secret: TEST_SECRET.into(),
        access_ttl: 1800,
        refresh_ttl: 60 * 60 * 24,
        cors_origins: vec!["https://app.example".into()],
        log_level: "sproutd=debug".into(),
    }
}

/// Start the server with an empty pool slot and no broker; returns the
/// bound address.
async fn start_test_server() -> SocketAddr {
    let state = AppState::new(ConnectionPool::unconfigured(), None, test_config());
    let app = sproutd::routes::build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("listener has no local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server error");
    });

    addr
}

/// Read frames until a close frame arrives and return it.
async fn expect_close(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> tokio_tungstenite::tungstenite::protocol::CloseFrame<'static> {
    let (_write, mut read) = stream.split();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), read.next())
            .await
            .expect("expected a close frame within the timeout");
        match frame {
            Some(Ok(Message::Close(Some(close)))) => return close,
            Some(Ok(_)) => continue,
            other => panic!("expected a close frame, got: {:?}", other),
        }
    }
}

#[tokio::test]
async fn health_answers_without_any_backend() {
    let addr = start_test_server().await;

    let resp = reqwest::get(format!("http://{}/health", addr))
        .await
        .expect("health request failed");
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.expect("health body is not JSON");
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn tokenless_socket_is_closed_before_any_pool_work() {
    let addr = start_test_server().await;

    // No database is configured, so reaching the pool would close with
    // 1011. A 4003 here proves the token check runs first.
    let url = format!("ws://{}/ws/stations/AA:BB:CC:DD:EE:FF", addr);
    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("websocket upgrade failed");

    let close = expect_close(stream).await;
    assert_eq!(close.code, CloseCode::from(CLOSE_UNAUTHORIZED));
    assert_eq!(close.reason, "Missing token");
}

#[tokio::test]
async fn socket_with_token_needs_a_database() {
    let addr = start_test_server().await;

    let token = sproutd::auth::issue_access_token(TEST_SECRET, 7, Some("u@example.com"), 1800)
        .expect("failed to mint token");
    let url = format!("ws://{}/ws/stations/AA:BB:CC:DD:EE:FF?token={}", addr, token);
    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("websocket upgrade failed");

    let close = expect_close(stream).await;
    assert_eq!(close.code, CloseCode::from(CLOSE_DB_UNAVAILABLE));
    assert_eq!(close.reason, "Database unavailable");
}

#[tokio::test]
async fn api_requests_fail_closed_without_a_database() {
    let addr = start_test_server().await;

    let token = sproutd::auth::issue_access_token(TEST_SECRET, 7, None, 1800)
        .expect("failed to mint token");
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/api/stations", addr))
        .bearer_auth(token)
        .send()
        .await
        .expect("stations request failed");

    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.expect("error body is not JSON");
    // Internal detail must not leak to clients.
    assert_eq!(body["detail"], "internal error");
}

#[tokio::test]
async fn cors_preflight_echoes_configured_origin() {
    let addr = start_test_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{}/api/stations", addr),
        )
        .header(reqwest::header::ORIGIN, "https://app.example")
        .header("access-control-request-method", "GET")
        .send()
        .await
        .expect("preflight request failed");

    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("https://app.example"),
    );
    assert_eq!(
        resp.headers()
            .get("access-control-allow-credentials")
            .and_then(|v| v.to_str().ok()),
        Some("true"),
    );
}

#[tokio::test]
async fn unlisted_origin_gets_no_cors_grant() {
    let addr = start_test_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{}/api/stations", addr),
        )
        .header(reqwest::header::ORIGIN, "https://evil.example")
        .header("access-control-request-method", "GET")
        .send()
        .await
        .expect("preflight request failed");

    assert!(resp
        .headers()
        .get("access-control-allow-origin")
        .is_none());
}
