//! The cascading checker

use std::collections::HashMap;
use std::time::{Duration, Instant};

use app_config::HealthCheckSpec;
use async_io::Timer;
use async_net::TcpStream;
use chrono::Utc;
use command_executor::process::pid_alive;
use futures::lock::Mutex;
use futures::stream::{self, StreamExt};
use futures_lite::future;
use serde_json::Value;
use service_registry::{HealthState, ServiceEntry};
use tracing::{debug, trace};

use crate::http::{self, HttpTarget};
use crate::report::{CheckType, HealthCheckResult, HealthReport};

/// Paths tried when discovering an HTTP health endpoint, in order
const DISCOVERY_PATHS: &[&str] = &["/health", "/healthz", "/ready", "/alive", "/ping"];

/// Checker tuning
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Per-path timeout during endpoint discovery
    pub discovery_timeout: Duration,
    /// Per-request probe timeout
    pub probe_timeout: Duration,
    /// Attempts per probe round
    pub retries: u32,
    /// Pause between attempts within a round
    pub retry_interval: Duration,
    /// Grace window after service start
    pub start_period: Duration,
    /// Concurrent services probed per round
    pub fan_out: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(5),
            retries: 3,
            retry_interval: Duration::from_secs(1),
            start_period: Duration::from_secs(30),
            fan_out: 10,
        }
    }
}

/// Health checker
///
/// Stateless across rounds except for the per-service discovered-endpoint
/// cache.
pub struct HealthChecker {
    config: CheckerConfig,
    endpoint_cache: Mutex<HashMap<String, HttpTarget>>,
}

impl HealthChecker {
    /// Checker with default tuning
    pub fn new() -> Self {
        Self::with_config(CheckerConfig::default())
    }

    /// Checker with explicit tuning
    pub fn with_config(config: CheckerConfig) -> Self {
        Self {
            config,
            endpoint_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Probe every service once, with bounded fan-out, and collect results
    ///
    /// The returned vector is sorted by service name. The call resolves only
    /// when every probe returned or timed out, which is what keeps rounds
    /// strictly sequential for callers that loop.
    pub async fn check_round(
        &self,
        services: &[(ServiceEntry, Option<HealthCheckSpec>)],
    ) -> Vec<HealthCheckResult> {
        let pending: Vec<futures::future::BoxFuture<'_, HealthCheckResult>> = services
            .iter()
            .map(|(entry, spec)| {
                Box::pin(self.check_service(entry, spec.as_ref()))
                    as futures::future::BoxFuture<'_, HealthCheckResult>
            })
            .collect();
        let mut results: Vec<HealthCheckResult> = stream::iter(pending)
            .buffer_unordered(self.config.fan_out.max(1))
            .collect()
            .await;
        results.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        results
    }

    /// Run one round and fold it into a report
    pub async fn report(
        &self,
        project: &str,
        services: &[(ServiceEntry, Option<HealthCheckSpec>)],
    ) -> HealthReport {
        let results = self.check_round(services).await;
        HealthReport::from_results(project, results)
    }

    /// Probe a single service through the cascade
    pub async fn check_service(
        &self,
        entry: &ServiceEntry,
        spec: Option<&HealthCheckSpec>,
    ) -> HealthCheckResult {
        let result = self.cascade(entry, spec).await;
        self.apply_start_period(entry, spec, result)
    }

    async fn cascade(
        &self,
        entry: &ServiceEntry,
        spec: Option<&HealthCheckSpec>,
    ) -> HealthCheckResult {
        let (method, timeout, retries, interval) = self.probe_params(spec);

        // Explicit endpoint wins over everything.
        if let Some(endpoint) = spec.and_then(|s| s.endpoint.as_deref()) {
            match HttpTarget::parse(endpoint, entry.port) {
                Ok(target) => {
                    return self
                        .http_probe(entry, &target, &method, timeout, retries, interval)
                        .await;
                }
                Err(e) => {
                    let mut result = HealthCheckResult::new(&entry.name, CheckType::Http);
                    result.status = HealthState::Unhealthy;
                    result.endpoint = Some(endpoint.to_string());
                    result.error = Some(e.to_string());
                    return result;
                }
            }
        }

        if entry.port > 0 {
            // Discovered endpoint, cached across rounds.
            if let Some(target) = self.cached_or_discover(entry).await {
                let result = self
                    .http_probe(entry, &target, &method, timeout, retries, interval)
                    .await;
                if matches!(result.error.as_deref(), Some("connection refused")) {
                    // The endpoint went away; rediscover next round.
                    self.endpoint_cache.lock().await.remove(&entry.key());
                }
                return result;
            }
            return self.tcp_probe(entry, timeout).await;
        }

        if entry.pid > 0 {
            return process_probe(entry);
        }

        let mut result = HealthCheckResult::new(&entry.name, CheckType::None);
        result.status = HealthState::Unknown;
        result.error = Some("no health method".to_string());
        result
    }

    fn probe_params(&self, spec: Option<&HealthCheckSpec>) -> (String, Duration, u32, Duration) {
        match spec {
            Some(spec) => (
                spec.method.clone(),
                Duration::from_secs(spec.timeout),
                spec.retries.max(1),
                Duration::from_secs(spec.retry_interval),
            ),
            None => (
                "GET".to_string(),
                self.config.probe_timeout,
                self.config.retries.max(1),
                self.config.retry_interval,
            ),
        }
    }

    async fn cached_or_discover(&self, entry: &ServiceEntry) -> Option<HttpTarget> {
        if let Some(target) = self.endpoint_cache.lock().await.get(&entry.key()) {
            return Some(target.clone());
        }

        for path in DISCOVERY_PATHS {
            let target = HttpTarget::localhost(entry.port, *path);
            match http::request("GET", &target, self.config.discovery_timeout).await {
                Ok(_) => {
                    debug!(service = %entry.name, path, "discovered health endpoint");
                    self.endpoint_cache
                        .lock()
                        .await
                        .insert(entry.key(), target.clone());
                    return Some(target);
                }
                Err(e) => {
                    trace!(service = %entry.name, path, "discovery miss: {}", e);
                }
            }
        }
        None
    }

    async fn http_probe(
        &self,
        entry: &ServiceEntry,
        target: &HttpTarget,
        method: &str,
        timeout: Duration,
        retries: u32,
        interval: Duration,
    ) -> HealthCheckResult {
        let mut result = HealthCheckResult::new(&entry.name, CheckType::Http);
        result.endpoint = Some(target.url());

        for attempt in 1..=retries {
            let started = Instant::now();
            match http::request(method, target, timeout).await {
                Ok(response) => {
                    result.response_time_ms = started.elapsed().as_millis() as u64;
                    result.status_code = Some(response.status);
                    let (status, details) = classify_response(&response);
                    result.status = status;
                    result.details = details;
                    result.error = match status {
                        HealthState::Unhealthy => {
                            Some(format!("endpoint returned HTTP {}", response.status))
                        }
                        _ => None,
                    };
                    result.timestamp = Utc::now();
                    // First positive result ends the round.
                    if matches!(status, HealthState::Healthy | HealthState::Degraded) {
                        return result;
                    }
                }
                Err(e) => {
                    result.response_time_ms = started.elapsed().as_millis() as u64;
                    result.status = HealthState::Unhealthy;
                    result.status_code = None;
                    result.error = Some(e.to_string());
                    result.timestamp = Utc::now();
                }
            }
            if attempt < retries {
                Timer::after(interval).await;
            }
        }
        result
    }

    async fn tcp_probe(&self, entry: &ServiceEntry, timeout: Duration) -> HealthCheckResult {
        let mut result = HealthCheckResult::new(&entry.name, CheckType::Port);
        let started = Instant::now();

        let connect = async {
            TcpStream::connect(("127.0.0.1", entry.port))
                .await
                .map(Some)
        };
        let deadline = async {
            Timer::after(timeout).await;
            Ok(None)
        };

        match future::or(connect, deadline).await {
            Ok(Some(_stream)) => {
                result.status = HealthState::Healthy;
            }
            Ok(None) => {
                result.status = HealthState::Unhealthy;
                result.error = Some(format!("tcp connect timed out after {:?}", timeout));
            }
            Err(e) => {
                result.status = HealthState::Unhealthy;
                result.error = Some(match e.kind() {
                    std::io::ErrorKind::ConnectionRefused => "connection refused".to_string(),
                    _ => e.to_string(),
                });
            }
        }
        result.response_time_ms = started.elapsed().as_millis() as u64;
        result.timestamp = Utc::now();
        result
    }

    /// Inside the start period a failing probe reads as "still warming up"
    fn apply_start_period(
        &self,
        entry: &ServiceEntry,
        spec: Option<&HealthCheckSpec>,
        mut result: HealthCheckResult,
    ) -> HealthCheckResult {
        let start_period = spec
            .map(|s| Duration::from_secs(s.start_period))
            .unwrap_or(self.config.start_period);
        let age = Utc::now().signed_duration_since(entry.started_at);
        let in_start_period = age.to_std().map(|a| a < start_period).unwrap_or(true);

        if in_start_period
            && matches!(result.status, HealthState::Unhealthy | HealthState::Unknown)
        {
            result.status = HealthState::Degraded;
        }
        result
    }

    /// Whether `entry` is still inside its start period
    pub fn in_start_period(&self, entry: &ServiceEntry, spec: Option<&HealthCheckSpec>) -> bool {
        let start_period = spec
            .map(|s| Duration::from_secs(s.start_period))
            .unwrap_or(self.config.start_period);
        Utc::now()
            .signed_duration_since(entry.started_at)
            .to_std()
            .map(|age| age < start_period)
            .unwrap_or(true)
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn process_probe(entry: &ServiceEntry) -> HealthCheckResult {
    let mut result = HealthCheckResult::new(&entry.name, CheckType::Process);
    if pid_alive(entry.pid) {
        result.status = HealthState::Healthy;
    } else {
        result.status = HealthState::Unhealthy;
        result.error = Some(format!("process {} is not running", entry.pid));
    }
    result
}

/// Map an HTTP response onto a health state
///
/// A JSON body with a recognized top-level `status` field wins over the
/// status code; otherwise 2xx/3xx counts as healthy.
fn classify_response(response: &http::HttpResponse) -> (HealthState, Option<Value>) {
    if let Ok(value) = serde_json::from_slice::<Value>(&response.body) {
        if let Some(status) = value.get("status").and_then(Value::as_str) {
            let mapped = match status.to_ascii_lowercase().as_str() {
                "healthy" | "ok" | "up" => Some(HealthState::Healthy),
                "degraded" | "warning" => Some(HealthState::Degraded),
                "unhealthy" | "down" | "error" => Some(HealthState::Unhealthy),
                _ => None,
            };
            if let Some(state) = mapped {
                return (state, Some(value));
            }
        }
        let state = if response.is_positive() {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };
        return (state, Some(value));
    }

    let state = if response.is_positive() {
        HealthState::Healthy
    } else {
        HealthState::Unhealthy
    };
    (state, None)
}
