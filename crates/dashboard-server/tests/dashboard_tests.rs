//! Dashboard REST and push-channel tests

use std::sync::Arc;
use std::time::Duration;

use async_net::TcpStream;
use dashboard_server::Dashboard;
use futures::{SinkExt, StreamExt};
use futures_lite::io::{AsyncReadExt, AsyncWriteExt};
use health_checker::HealthChecker;
use log_multiplexer::LogMultiplexer;
use service_registry::{Registry, RegistryStore, ServiceEntry};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    registry: Arc<Registry>,
    logs: Arc<LogMultiplexer>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::with_store(RegistryStore::at(
            dir.path().join("services.json"),
        )));
        Self {
            dir,
            registry,
            logs: Arc::new(LogMultiplexer::new()),
        }
    }

    fn dashboard(&self) -> Dashboard {
        Dashboard::new(
            "demo",
            self.dir.path(),
            self.registry.clone(),
            Arc::new(HealthChecker::new()),
            self.logs.clone(),
        )
    }
}

async fn http_get(port: u16, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).into_owned();

    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

#[test]
fn test_services_endpoint_returns_project_entries() {
    smol::block_on(async {
        let fixture = Fixture::new();
        let entry = ServiceEntry::new(fixture.dir.path(), "web", std::process::id()).with_port(3000);
        fixture.registry.register(entry).await.unwrap();

        // An entry from another project must not leak in.
        let other = ServiceEntry::new("/elsewhere", "stranger", std::process::id());
        fixture.registry.register(other).await.unwrap();

        let handle = fixture.dashboard().serve(0).await.unwrap();
        let port = handle.port();

        let (status, body) = http_get(port, "/api/services").await;
        assert_eq!(status, 200);
        let services: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(services.as_array().unwrap().len(), 1);
        assert_eq!(services[0]["name"], "web");
        assert_eq!(services[0]["url"], "http://localhost:3000");

        let (status, body) = http_get(port, "/api/services/all").await;
        assert_eq!(status, 200);
        let all: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);

        handle.stop().await;
    });
}

#[test]
fn test_health_endpoint_synthesizes_report() {
    smol::block_on(async {
        let fixture = Fixture::new();
        // No port, live pid: the process probe reports healthy.
        let mut entry = ServiceEntry::new(fixture.dir.path(), "worker", std::process::id());
        entry.started_at = chrono::Utc::now() - chrono::Duration::hours(1);
        fixture.registry.register(entry).await.unwrap();

        let handle = fixture.dashboard().serve(0).await.unwrap();
        let (status, body) = http_get(handle.port(), "/api/health").await;

        assert_eq!(status, 200);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["project"], "demo");
        assert_eq!(report["summary"]["total"], 1);
        assert_eq!(report["services"][0]["checkType"], "process");
        assert_eq!(report["summary"]["overall"], "healthy");

        handle.stop().await;
    });
}

#[test]
fn test_fallback_page_and_api_404() {
    smol::block_on(async {
        let fixture = Fixture::new();
        let handle = fixture.dashboard().serve(0).await.unwrap();

        let (status, body) = http_get(handle.port(), "/").await;
        assert_eq!(status, 200);
        assert!(body.contains("azd app dashboard"));

        let (status, _) = http_get(handle.port(), "/api/nope").await;
        assert_eq!(status, 404);

        handle.stop().await;
    });
}

#[test]
fn test_push_channel_streams_registry_changes() {
    smol::block_on(async {
        let fixture = Fixture::new();
        let handle = fixture.dashboard().serve(0).await.unwrap();
        let port = handle.port();

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (mut ws, _) = async_tungstenite::client_async(
            format!("ws://127.0.0.1:{}/api/ws", port),
            stream,
        )
        .await
        .unwrap();

        // Seed frame with the current (empty) registry.
        let seed = recv_json(&mut ws).await;
        assert_eq!(seed["type"], "registry");
        assert!(seed["timestamp"].is_string());
        assert_eq!(seed["payload"].as_array().unwrap().len(), 0);

        // A registry change is mirrored to the channel.
        let entry = ServiceEntry::new(fixture.dir.path(), "api", std::process::id()).with_port(8080);
        fixture.registry.register(entry).await.unwrap();

        let update = recv_json(&mut ws).await;
        assert_eq!(update["type"], "registry");
        assert_eq!(update["payload"][0]["name"], "api");

        // Log lines arrive as batched log envelopes.
        fixture
            .logs
            .ingest("api", log_multiplexer::LogStream::Stdout, "hello");
        let log = recv_json(&mut ws).await;
        assert_eq!(log["type"], "log");
        assert_eq!(log["payload"][0]["line"], "hello");

        ws.send(tungstenite::Message::Close(None)).await.ok();
        handle.stop().await;
    });
}

async fn recv_json<S>(ws: &mut async_tungstenite::WebSocketStream<S>) -> serde_json::Value
where
    S: futures_lite::AsyncRead + futures_lite::AsyncWrite + Unpin,
{
    let deadline = async {
        smol::Timer::after(Duration::from_secs(5)).await;
        panic!("timed out waiting for push frame");
    };
    let next = async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return serde_json::from_str(&text).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("push channel ended: {:?}", other),
            }
        }
    };
    futures_lite::future::or(next, deadline).await
}
