//! Progress WebSocket tests with real connections to an in-memory test
//! server: event ordering during transfers, listener supersession, and
//! transfer survival when the watching socket goes away.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Extension;
use futures::StreamExt;
use gangway::{
    auth::AuthExtractor,
    blob_store::MemoryBlobStore,
    config::{Config, S3Config},
    db::{GatewayRepo, init_database},
    handlers::{self, ApiState},
    namespaces::ensure_reserved_namespaces,
    progress::ProgressHub,
    rate_limit::RateLimiter,
};
use rusqlite::Connection;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_path: ":memory:".to_string(),
        admin_username: "admin".to_string(),
        admin_password: "unused".to_string(),
        session_expiry_days: 7,
        cors_origins: vec!["http://localhost:5173".to_string()],
        cookie_secure: false,
        s3: S3Config {
            bucket: "gangway-test".to_string(),
            endpoint: None,
            region: "auto".to_string(),
            access_key_id: None,
            secret_access_key: None,
            prefix: "blobs".to_string(),
        },
        meta_timeout_secs: 5,
        upload_timeout_secs: 30,
        download_min_timeout_secs: 10,
        max_upload_bytes: 64 * 1024 * 1024,
    }
}

/// Start a gateway on a random port with an in-memory store and one seeded
/// session. Returns the bound address, a bearer token, and a shutdown handle.
async fn start_test_server() -> (SocketAddr, String, oneshot::Sender<()>) {
    let conn = Connection::open_in_memory().expect("in-memory sqlite");
    init_database(&conn).expect("init db");
    let repo = GatewayRepo::new(Arc::new(Mutex::new(conn)));
    ensure_reserved_namespaces(&repo).expect("reserved namespaces");

    let password_hash = gangway::auth::hash_password("gate-pass").expect("hash password");
    let user = repo.create_user("keeper", &password_hash).expect("create user");
    let session = repo
        .create_session(&user.id, chrono::Utc::now() + chrono::Duration::days(1))
        .expect("create session");

    let state = ApiState {
        config: Arc::new(test_config()),
        repo: repo.clone(),
        store: Arc::new(MemoryBlobStore::new()),
        hub: Arc::new(ProgressHub::new()),
        rate_limiter: Arc::new(RateLimiter::new()),
    };
    let app = handlers::router(state).layer(Extension(AuthExtractor::new(repo)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    (addr, session.token, shutdown_tx)
}

async fn connect_ws(addr: SocketAddr, token: &str, transfer_id: &str) -> WsStream {
    let mut request = format!("ws://{addr}/ws?id={transfer_id}")
        .into_client_request()
        .expect("ws request");
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {token}").parse().expect("header value"),
    );
    let (ws, _) = connect_async(request).await.expect("ws connect");
    ws
}

/// Read the next progress event off the socket, skipping non-text frames.
async fn next_event(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("event before timeout")
            .expect("socket open")
            .expect("websocket message");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("event json");
        }
    }
}

fn multipart_body(filename: &str, content: &[u8]) -> (String, Vec<u8>) {
    let boundary = "gangway-ws-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

async fn upload(
    client: &reqwest::Client,
    addr: SocketAddr,
    token: &str,
    transfer_id: &str,
    filename: &str,
    content: &[u8],
    declare_size: bool,
) {
    let (content_type, body) = multipart_body(filename, content);
    let mut request = client
        .post(format!("http://{addr}/storage/upload?id={transfer_id}"))
        .header("content-type", content_type)
        .header("authorization", format!("Bearer {token}"))
        .body(body);
    if declare_size {
        request = request.header("x-file-size", content.len().to_string());
    }
    let response = request.send().await.expect("upload response");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn ws_requires_auth() {
    let (addr, _token, shutdown) = start_test_server().await;

    let request = format!("ws://{addr}/ws?id=t-1")
        .into_client_request()
        .expect("ws request");
    assert!(connect_async(request).await.is_err());

    let _ = shutdown.send(());
}

#[tokio::test]
async fn upload_progress_is_monotonic_with_one_terminal_event() {
    let (addr, token, shutdown) = start_test_server().await;
    let client = reqwest::Client::new();
    let total = 300 * 1024_u64;
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

    let mut ws = connect_ws(addr, &token, "up-1").await;
    upload(&client, addr, &token, "up-1", "big.bin", &payload, true).await;

    let mut events = Vec::new();
    loop {
        let event = next_event(&mut ws).await;
        let done = event["done"].as_bool().expect("done flag");
        events.push(event);
        if done {
            break;
        }
    }

    assert!(!events.is_empty());
    let mut last_bytes = 0;
    for event in &events {
        assert_eq!(event["id"], "up-1");
        assert_eq!(event["direction"], "upload");
        assert_eq!(event["total"], total);
        assert!(event.get("error").is_none());
        let bytes = event["bytes"].as_u64().expect("bytes");
        assert!(bytes >= last_bytes, "byte counts must never decrease");
        last_bytes = bytes;
    }
    let terminal = events.last().expect("terminal event");
    assert_eq!(terminal["bytes"], total);
    assert_eq!(events.iter().filter(|e| e["done"] == true).count(), 1);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn download_events_flow_while_body_is_still_streaming() {
    let (addr, token, shutdown) = start_test_server().await;
    let client = reqwest::Client::new();
    let total = 1024 * 1024_u64;
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    upload(&client, addr, &token, "seed", "movie.bin", &payload, true).await;

    let mut ws = connect_ws(addr, &token, "dl-1").await;

    let mut response = client
        .get(format!("http://{addr}/storage/download?name=movie.bin&id=dl-1"))
        .send()
        .await
        .expect("download response");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.content_length(), Some(total));

    // Pull one chunk, then check progress arrived before the body finished.
    let first = response
        .chunk()
        .await
        .expect("first chunk")
        .expect("non-empty body");
    let mut received = first.len() as u64;

    let event = next_event(&mut ws).await;
    assert_eq!(event["id"], "dl-1");
    assert_eq!(event["direction"], "download");
    assert_eq!(event["done"], false);
    let bytes = event["bytes"].as_u64().expect("bytes");
    assert!(bytes > 0 && bytes < total, "expected a mid-transfer event");

    while let Some(chunk) = response.chunk().await.expect("chunk") {
        received += chunk.len() as u64;
    }
    assert_eq!(received, total);

    loop {
        let event = next_event(&mut ws).await;
        if event["done"] == true {
            assert_eq!(event["bytes"], total);
            assert_eq!(event["total"], total);
            assert!(event.get("error").is_none());
            break;
        }
    }

    let _ = shutdown.send(());
}

#[tokio::test]
async fn second_listener_supersedes_first() {
    let (addr, token, shutdown) = start_test_server().await;
    let client = reqwest::Client::new();

    let mut first = connect_ws(addr, &token, "shared").await;
    let mut second = connect_ws(addr, &token, "shared").await;

    // The older socket's stream must end once the id is claimed again.
    match tokio::time::timeout(Duration::from_secs(5), first.next()).await {
        Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => {}
        Ok(Some(Ok(other))) => panic!("unexpected frame on superseded socket: {other:?}"),
        Err(_) => panic!("superseded socket did not close"),
    }

    upload(&client, addr, &token, "shared", "x.bin", b"payload", false).await;

    loop {
        let event = next_event(&mut second).await;
        if event["done"] == true {
            assert_eq!(event["bytes"], 7);
            break;
        }
    }

    let _ = shutdown.send(());
}

#[tokio::test]
async fn closing_the_ws_does_not_abort_the_download() {
    let (addr, token, shutdown) = start_test_server().await;
    let client = reqwest::Client::new();
    let total = 256 * 1024_u64;
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    upload(&client, addr, &token, "seed", "keep.bin", &payload, true).await;

    let ws = connect_ws(addr, &token, "dl-2").await;

    let mut response = client
        .get(format!("http://{addr}/storage/download?name=keep.bin&id=dl-2"))
        .send()
        .await
        .expect("download response");
    let first = response
        .chunk()
        .await
        .expect("first chunk")
        .expect("non-empty body");
    let mut received = first.len() as u64;

    // Walk away from the progress feed mid-transfer.
    drop(ws);

    while let Some(chunk) = response.chunk().await.expect("chunk") {
        received += chunk.len() as u64;
    }
    assert_eq!(received, total, "download must complete without a listener");

    let _ = shutdown.send(());
}
