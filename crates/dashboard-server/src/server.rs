//! Dashboard listener, routing and state watchers

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use app_config::HealthCheckSpec;
use async_io::Timer;
use async_net::{TcpListener, TcpStream};
use command_executor::CancelToken;
use futures_lite::future;
use health_checker::HealthChecker;
use log_multiplexer::{LogFilter, LogMultiplexer};
use serde_json::json;
use service_registry::Registry;
use tracing::{debug, info, warn};

use crate::assets::FALLBACK_HTML;
use crate::http::{accept_websocket, read_request, write_html, write_json};
use crate::push::{run_connection, Envelope, Hub};
use crate::{Error, Result};

/// Pause between dashboard-driven health rounds
const HEALTH_ROUND_INTERVAL: Duration = Duration::from_secs(10);

/// Dashboard server for one project
pub struct Dashboard {
    project_name: String,
    project_dir: PathBuf,
    registry: Arc<Registry>,
    health: Arc<HealthChecker>,
    logs: Arc<LogMultiplexer>,
    health_specs: HashMap<String, HealthCheckSpec>,
}

struct State {
    project_name: String,
    project_dir: PathBuf,
    registry: Arc<Registry>,
    health: Arc<HealthChecker>,
    logs: Arc<LogMultiplexer>,
    health_specs: HashMap<String, HealthCheckSpec>,
}

impl Dashboard {
    /// Build a dashboard over the run's shared components
    pub fn new(
        project_name: impl Into<String>,
        project_dir: impl Into<PathBuf>,
        registry: Arc<Registry>,
        health: Arc<HealthChecker>,
        logs: Arc<LogMultiplexer>,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            project_dir: project_dir.into(),
            registry,
            health,
            logs,
            health_specs: HashMap::new(),
        }
    }

    /// Declared health checks, keyed by service name, for report rounds
    pub fn with_health_specs(mut self, specs: HashMap<String, HealthCheckSpec>) -> Self {
        self.health_specs = specs;
        self
    }

    /// Bind the listener and start serving
    ///
    /// `port` usually comes from the `azd-app-dashboard` assignment; 0 binds
    /// an ephemeral port (tests).
    pub async fn serve(self, port: u16) -> Result<DashboardHandle> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| Error::Bind {
                port,
                reason: e.to_string(),
            })?;
        let port = listener.local_addr()?.port();
        info!(project = %self.project_name, port, "dashboard listening");

        let stop = CancelToken::new();
        let hub = Arc::new(Hub::default());
        let state = Arc::new(State {
            project_name: self.project_name,
            project_dir: self.project_dir,
            registry: self.registry,
            health: self.health,
            logs: self.logs.clone(),
            health_specs: self.health_specs,
        });

        let mut tasks = Vec::new();
        tasks.push(smol::spawn(accept_loop(
            listener,
            state.clone(),
            hub.clone(),
            stop.clone(),
        )));
        tasks.push(smol::spawn(registry_watcher(
            state.clone(),
            hub.clone(),
            stop.clone(),
        )));
        tasks.push(smol::spawn(log_watcher(
            self.logs.clone(),
            hub.clone(),
            stop.clone(),
        )));
        tasks.push(smol::spawn(health_round_loop(
            state,
            hub.clone(),
            stop.clone(),
        )));

        Ok(DashboardHandle {
            port,
            stop,
            hub,
            tasks,
        })
    }
}

/// Running dashboard; dropping it without `stop` detaches nothing, the
/// orchestrating caller is expected to stop it during shutdown
pub struct DashboardHandle {
    port: u16,
    stop: CancelToken,
    hub: Arc<Hub>,
    tasks: Vec<smol::Task<()>>,
}

impl DashboardHandle {
    /// The bound dashboard port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The dashboard URL
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Stop the listener, watchers and every push connection
    pub async fn stop(self) {
        self.stop.cancel();
        self.hub.close();
        for task in self.tasks {
            let bounded = async {
                task.await;
            };
            let timeout = async {
                Timer::after(Duration::from_secs(2)).await;
            };
            future::or(bounded, timeout).await;
        }
        debug!("dashboard stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<State>,
    hub: Arc<Hub>,
    stop: CancelToken,
) {
    loop {
        let accepted = {
            let accept = async { Some(listener.accept().await) };
            let cancelled = async {
                stop.cancelled().await;
                None
            };
            future::or(cancelled, accept).await
        };

        match accepted {
            None => break,
            Some(Ok((stream, peer))) => {
                debug!(%peer, "dashboard connection");
                let state = state.clone();
                let hub = hub.clone();
                smol::spawn(async move {
                    if let Err(e) = handle_connection(stream, state, hub).await {
                        debug!("dashboard connection ended: {}", e);
                    }
                })
                .detach();
            }
            Some(Err(e)) => {
                warn!("dashboard accept failed: {}", e);
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<State>, hub: Arc<Hub>) -> Result<()> {
    let request = read_request(&mut stream).await?;

    if request.method != "GET" {
        return write_json(&mut stream, 405, r#"{"error":"method not allowed"}"#).await;
    }

    match request.path.as_str() {
        "/api/services" => {
            let services = state.registry.list_by_project(&state.project_dir).await?;
            let body = serde_json::to_string(&services).unwrap_or_else(|_| "[]".into());
            write_json(&mut stream, 200, &body).await
        }
        "/api/services/all" => {
            let services = state.registry.list_all().await?;
            let body = serde_json::to_string(&services).unwrap_or_else(|_| "[]".into());
            write_json(&mut stream, 200, &body).await
        }
        "/api/health" => {
            let report = fresh_report(&state).await?;
            let body = serde_json::to_string(&report).unwrap_or_else(|_| "{}".into());
            write_json(&mut stream, 200, &body).await
        }
        "/api/logs" => {
            let filter = LogFilter {
                service: request.query.get("service").cloned(),
                stream: match request.query.get("stream").map(String::as_str) {
                    Some("stdout") => Some(log_multiplexer::LogStream::Stdout),
                    Some("stderr") => Some(log_multiplexer::LogStream::Stderr),
                    _ => None,
                },
                grep: None,
            };
            let tail = request
                .query
                .get("tail")
                .and_then(|t| t.parse::<usize>().ok())
                .unwrap_or(100);
            let events = state.logs.snapshot(&filter, Some(tail));
            let body = serde_json::to_string(&events).unwrap_or_else(|_| "[]".into());
            write_json(&mut stream, 200, &body).await
        }
        "/api/ws" => match (request.wants_upgrade(), request.websocket_key()) {
            (true, Some(key)) => {
                let key = key.to_string();
                let seed = registry_envelope(&state).await.ok();
                let ws = accept_websocket(stream, &key).await?;
                let feed = hub.subscribe_seeded(seed);
                run_connection(ws, feed).await;
                Ok(())
            }
            _ => write_json(&mut stream, 400, r#"{"error":"websocket upgrade required"}"#).await,
        },
        path if path.starts_with("/api/") => {
            write_json(&mut stream, 404, r#"{"error":"not found"}"#).await
        }
        // Anything else gets the UI; the embedded bundle is optional and
        // the fallback page stands in for it.
        _ => write_html(&mut stream, 200, FALLBACK_HTML).await,
    }
}

async fn fresh_report(state: &State) -> Result<health_checker::HealthReport> {
    let entries = state.registry.list_by_project(&state.project_dir).await?;
    let services: Vec<_> = entries
        .into_iter()
        .map(|entry| {
            let spec = state.health_specs.get(&entry.name).cloned();
            (entry, spec)
        })
        .collect();
    Ok(state.health.report(&state.project_name, &services).await)
}

async fn registry_envelope(state: &State) -> Result<Envelope> {
    let services = state.registry.list_by_project(&state.project_dir).await?;
    Ok(Envelope::new("registry", json!(services)))
}

/// Mirror registry changes to the push channel
async fn registry_watcher(state: Arc<State>, hub: Arc<Hub>, stop: CancelToken) {
    let events = state.registry.subscribe().await;
    loop {
        let event = {
            let next = async { events.recv().await.ok() };
            let cancelled = async {
                stop.cancelled().await;
                None
            };
            future::or(cancelled, next).await
        };
        if event.is_none() {
            break;
        }
        match registry_envelope(&state).await {
            Ok(envelope) => hub.broadcast(envelope),
            Err(e) => debug!("registry snapshot failed: {}", e),
        }
    }
}

/// Mirror log lines to the push channel
async fn log_watcher(logs: Arc<LogMultiplexer>, hub: Arc<Hub>, stop: CancelToken) {
    let feed = logs.subscribe(LogFilter::default(), None);
    loop {
        let event = {
            let next = async { feed.recv().await.ok() };
            let cancelled = async {
                stop.cancelled().await;
                None
            };
            future::or(cancelled, next).await
        };
        let Some(event) = event else { break };
        hub.broadcast(Envelope::new("log", json!(event)));
    }
}

/// Periodic health rounds pushed to connected clients
async fn health_round_loop(state: Arc<State>, hub: Arc<Hub>, stop: CancelToken) {
    loop {
        let expired = {
            let tick = async {
                Timer::after(HEALTH_ROUND_INTERVAL).await;
                true
            };
            let cancelled = async {
                stop.cancelled().await;
                false
            };
            future::or(cancelled, tick).await
        };
        if !expired {
            break;
        }
        if hub.is_empty() {
            continue;
        }
        match fresh_report(&state).await {
            Ok(report) => hub.broadcast(Envelope::new("health", json!(report))),
            Err(e) => debug!("health round failed: {}", e),
        }
    }
}
