//! Probe results and report synthesis

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_registry::HealthState;

/// Which probe produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// HTTP endpoint probe
    Http,
    /// TCP connect probe
    Port,
    /// PID liveness probe
    Process,
    /// No probe method applied
    None,
}

/// Result of probing one service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    /// The probed service
    pub service_name: String,
    /// Health classification
    pub status: HealthState,
    /// Probe method used
    pub check_type: CheckType,
    /// Endpoint probed, for HTTP checks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Probe duration in milliseconds
    pub response_time_ms: u64,
    /// HTTP status code, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Probe error, when the check did not pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the probe finished
    pub timestamp: DateTime<Utc>,
    /// Structured payload returned by the endpoint, when it parsed as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HealthCheckResult {
    /// Result shell for a service, to be filled by a probe
    pub fn new(service_name: impl Into<String>, check_type: CheckType) -> Self {
        Self {
            service_name: service_name.into(),
            status: HealthState::Unknown,
            check_type,
            endpoint: None,
            response_time_ms: 0,
            status_code: None,
            error: None,
            timestamp: Utc::now(),
            details: None,
        }
    }
}

/// Aggregated counts for a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    /// Number of probed services
    pub total: usize,
    /// Services reported healthy
    pub healthy: usize,
    /// Services reported degraded
    pub degraded: usize,
    /// Services reported unhealthy
    pub unhealthy: usize,
    /// Services without an applicable probe
    pub unknown: usize,
    /// Worst-of classification across all services
    pub overall: HealthState,
}

/// Snapshot of one health round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// When the round finished
    pub timestamp: DateTime<Utc>,
    /// Project name
    pub project: String,
    /// Per-service results
    pub services: Vec<HealthCheckResult>,
    /// Aggregated counts
    pub summary: HealthSummary,
}

impl HealthReport {
    /// Build a report from a finished round
    ///
    /// Overall is worst-of; a service still `unknown` past its start period
    /// has no working probe path left, so it weighs in as unhealthy.
    pub fn from_results(project: impl Into<String>, services: Vec<HealthCheckResult>) -> Self {
        let mut summary = HealthSummary {
            total: services.len(),
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            unknown: 0,
            overall: HealthState::Unknown,
        };

        for result in &services {
            match result.status {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Degraded => summary.degraded += 1,
                HealthState::Unhealthy => summary.unhealthy += 1,
                HealthState::Unknown => summary.unknown += 1,
            }
        }

        summary.overall = if summary.unhealthy > 0 || summary.unknown > 0 {
            HealthState::Unhealthy
        } else if summary.degraded > 0 {
            HealthState::Degraded
        } else if summary.healthy > 0 {
            HealthState::Healthy
        } else {
            HealthState::Unknown
        };

        Self {
            timestamp: Utc::now(),
            project: project.into(),
            services,
            summary,
        }
    }
}
