//! `azd-app logs`: fetch captured output through the project dashboard
//!
//! The log buffers live inside the process supervising the services, so
//! this command goes through that process's dashboard: a snapshot from
//! `/api/logs`, optionally followed by the live push channel.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_net::TcpStream;
use futures::StreamExt;
use health_checker::http::{request, HttpTarget};
use port_manager::DASHBOARD_SERVICE;
use serde_json::Value;

use crate::context;

pub async fn run(
    project: &Path,
    service: Option<String>,
    tail: usize,
    follow: bool,
) -> Result<u8> {
    let project_dir = context::project_dir(project)?;
    let ctx = context::run_context(&project_dir);

    let assignments = ctx.ports.load_assignments().await?;
    let Some(dashboard) = assignments.assignments.get(DASHBOARD_SERVICE) else {
        bail!(
            "no dashboard recorded for this project; is `azd-app start` running in {}?",
            project_dir.display()
        );
    };
    let port = dashboard.port;

    // History first.
    let mut path = format!("/api/logs?tail={}", tail);
    if let Some(service) = &service {
        path.push_str(&format!("&service={}", service));
    }
    let target = HttpTarget::localhost(port, path);
    let response = request("GET", &target, Duration::from_secs(5))
        .await
        .context("dashboard is not answering; is `azd-app start` still running?")?;
    let events: Vec<Value> = serde_json::from_slice(&response.body).unwrap_or_default();
    for event in &events {
        print_event(event);
    }

    if !follow {
        return Ok(0);
    }

    // Then the live push channel.
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let (mut ws, _) =
        async_tungstenite::client_async(format!("ws://127.0.0.1:{}/api/ws", port), stream)
            .await
            .context("failed to open the dashboard push channel")?;

    while let Some(message) = ws.next().await {
        let Ok(tungstenite::Message::Text(text)) = message else {
            continue;
        };
        let Ok(envelope) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if envelope["type"] != "log" {
            continue;
        }
        if let Some(batch) = envelope["payload"].as_array() {
            for event in batch {
                if let Some(wanted) = &service {
                    if event["serviceName"].as_str() != Some(wanted) {
                        continue;
                    }
                }
                print_event(event);
            }
        }
    }

    Ok(0)
}

fn print_event(event: &Value) {
    let service = event["serviceName"].as_str().unwrap_or("?");
    let stream = event["stream"].as_str().unwrap_or("?");
    let line = event["line"].as_str().unwrap_or_default();
    match stream {
        "stderr" => eprintln!("[{}] {}", service, line),
        _ => println!("[{}] {}", service, line),
    }
}
