//! Integration tests for the probe cascade

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures_lite::io::{AsyncReadExt, AsyncWriteExt};
use health_checker::{CheckType, CheckerConfig, HealthChecker};
use service_registry::{HealthState, ServiceEntry};

fn fast_checker() -> HealthChecker {
    HealthChecker::with_config(CheckerConfig {
        discovery_timeout: Duration::from_millis(100),
        probe_timeout: Duration::from_secs(2),
        retries: 1,
        retry_interval: Duration::from_millis(50),
        start_period: Duration::from_secs(30),
        fan_out: 10,
    })
}

/// Entry that is well past its start period
fn aged_entry(name: &str, port: u16, pid: u32) -> ServiceEntry {
    let mut entry = ServiceEntry::new("/proj", name, pid).with_port(port);
    entry.started_at = Utc::now() - ChronoDuration::hours(1);
    entry
}

/// Serve canned HTTP responses until the task is dropped
fn spawn_http_server(response: &'static str) -> (u16, smol::Task<()>) {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let port = std_listener.local_addr().unwrap().port();
    let listener = async_net::TcpListener::try_from(std_listener).unwrap();
    let task = smol::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });
    (port, task)
}

#[test]
fn test_tcp_only_listener_reports_port_healthy() {
    smol::block_on(async {
        // A listener that accepts but never speaks HTTP.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let checker = fast_checker();
        let entry = aged_entry("tcp-only", port, 0);
        let result = checker.check_service(&entry, None).await;

        assert_eq!(result.check_type, CheckType::Port);
        assert_eq!(result.status, HealthState::Healthy);
    });
}

#[test]
fn test_http_endpoint_discovered_and_cached() {
    smol::block_on(async {
        let (port, _server) = spawn_http_server(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{\"status\":\"ok\"}",
        );

        let checker = fast_checker();
        let entry = aged_entry("web", port, 0);

        let result = checker.check_service(&entry, None).await;
        assert_eq!(result.check_type, CheckType::Http);
        assert_eq!(result.status, HealthState::Healthy);
        assert_eq!(
            result.endpoint.as_deref(),
            Some(format!("http://localhost:{}/health", port).as_str())
        );
        assert_eq!(result.status_code, Some(200));

        // Second round hits the cached endpoint.
        let again = checker.check_service(&entry, None).await;
        assert_eq!(again.check_type, CheckType::Http);
        assert_eq!(again.status, HealthState::Healthy);
    });
}

#[test]
fn test_json_status_field_overrides_http_code() {
    smol::block_on(async {
        let (port, _server) = spawn_http_server(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{\"status\":\"down\"}",
        );

        let checker = fast_checker();
        let entry = aged_entry("web", port, 0);
        let result = checker.check_service(&entry, None).await;

        assert_eq!(result.check_type, CheckType::Http);
        assert_eq!(result.status, HealthState::Unhealthy);
    });
}

#[test]
fn test_dead_port_reports_connection_refused() {
    smol::block_on(async {
        // Bind-and-release so the port is certainly closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let checker = fast_checker();
        let entry = aged_entry("gone", port, 0);
        let result = checker.check_service(&entry, None).await;

        assert_eq!(result.check_type, CheckType::Port);
        assert_eq!(result.status, HealthState::Unhealthy);
        assert_eq!(result.error.as_deref(), Some("connection refused"));
    });
}

#[test]
fn test_explicit_endpoint_skips_discovery() {
    smol::block_on(async {
        let (port, _server) = spawn_http_server(
            "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nplain text ok",
        );

        let checker = fast_checker();
        let entry = aged_entry("api", port, 0);
        let spec = app_config::HealthCheckSpec {
            endpoint: Some("/custom-status".to_string()),
            ..Default::default()
        };
        let result = checker.check_service(&entry, Some(&spec)).await;

        assert_eq!(result.check_type, CheckType::Http);
        assert_eq!(result.status, HealthState::Healthy);
        assert_eq!(
            result.endpoint.as_deref(),
            Some(format!("http://localhost:{}/custom-status", port).as_str())
        );
    });
}

#[test]
fn test_process_probe_when_no_port() {
    smol::block_on(async {
        let checker = fast_checker();
        let entry = aged_entry("worker", 0, std::process::id());
        let result = checker.check_service(&entry, None).await;

        assert_eq!(result.check_type, CheckType::Process);
        assert_eq!(result.status, HealthState::Healthy);
    });
}

#[test]
fn test_no_method_is_unknown() {
    smol::block_on(async {
        let checker = fast_checker();
        let entry = aged_entry("mystery", 0, 0);
        let result = checker.check_service(&entry, None).await;

        assert_eq!(result.check_type, CheckType::None);
        assert_eq!(result.status, HealthState::Unknown);
        assert_eq!(result.error.as_deref(), Some("no health method"));
    });
}

#[test]
fn test_start_period_downgrades_failures() {
    smol::block_on(async {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let checker = fast_checker();
        // Freshly started: failures read as warming up.
        let entry = ServiceEntry::new("/proj", "fresh", 0).with_port(port);
        let result = checker.check_service(&entry, None).await;

        assert_eq!(result.status, HealthState::Degraded);
    });
}

#[test]
fn test_round_aggregates_into_report() {
    smol::block_on(async {
        let (port, _server) = spawn_http_server(
            "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n{\"status\":\"healthy\"}",
        );

        let checker = fast_checker();
        let services = vec![
            (aged_entry("web", port, 0), None),
            (aged_entry("mystery", 0, 0), None),
        ];

        let report = checker.report("shop", &services).await;
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.healthy, 1);
        assert_eq!(report.summary.unknown, 1);
        assert_eq!(report.summary.overall, HealthState::Unhealthy);
    });
}
