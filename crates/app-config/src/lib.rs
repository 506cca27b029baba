//! # App Configuration
//!
//! Typed model of the `azure.yaml` project manifest consumed by the
//! orchestrator, together with the Docker-Compose port-specification grammar
//! and the targeted writeback that records auto-assigned ports.

#![warn(missing_docs)]

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod parser;
pub mod ports;
pub mod writeback;

pub use parser::{load_file, load_str};
pub use ports::{PortProtocol, PortSpec};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the manifest file
    #[error("failed to read manifest: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("failed to parse manifest YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("invalid manifest: {0}")]
    Validation(String),

    /// A port specification string could not be parsed
    #[error("service '{service}' has invalid port spec '{spec}': {reason}")]
    InvalidPortSpec {
        /// Service declaring the port
        service: String,
        /// The offending specification string
        spec: String,
        /// Why parsing failed
        reason: String,
    },

    /// A service references an unknown dependency
    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency {
        /// The dependent service
        service: String,
        /// The missing dependency name
        dependency: String,
    },

    /// Two services share a name
    #[error("duplicate service name '{0}'")]
    DuplicateService(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root manifest structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// The project block
    pub project: Project,
}

/// A project and the services it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Project name
    pub name: String,

    /// Service definitions, unique by name
    pub services: Vec<ServiceSpec>,

    /// Advisory dashboard settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard: Option<DashboardConfig>,

    /// Orchestrator tuning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<OrchestratorConfig>,
}

impl Project {
    /// Look up a service by name
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Effective orchestrator settings, defaults applied
    pub fn orchestrator(&self) -> OrchestratorConfig {
        self.orchestrator.clone().unwrap_or_default()
    }
}

/// Advisory dashboard settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// Preferred dashboard port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Orchestrator tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Abort the whole run when any service fails to start
    #[serde(default)]
    pub fail_fast: bool,

    /// Order in which services are stopped
    #[serde(default)]
    pub shutdown_order: ShutdownOrder,

    /// Seconds a service may spend probing before it is errored
    #[serde(default = "default_readiness_deadline")]
    pub readiness_deadline: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            shutdown_order: ShutdownOrder::default(),
            readiness_deadline: default_readiness_deadline(),
        }
    }
}

/// Shutdown ordering strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownOrder {
    /// Reverse topological order (dependents first)
    #[default]
    Reverse,
    /// All services at once
    Parallel,
}

/// One declared unit of execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Unique service name within the project
    pub name: String,

    /// Absolute service directory; defaults to the manifest's directory
    #[serde(default)]
    pub project_dir: PathBuf,

    /// How the service is executed
    pub kind: ServiceKind,

    /// Free-form language tag (e.g. "js", "python", "dotnet")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Free-form framework tag (e.g. "express", "fastapi", "aspire")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,

    /// Argv template; first element is the program
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Named package-manager entry (e.g. an npm script) instead of `command`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Port specifications in Docker-Compose syntax
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,

    /// Allow moving to a nearby free port when the declared one is taken
    #[serde(default = "default_flexible")]
    pub flexible: bool,

    /// Environment overrides layered over the inherited environment
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Optional health check declaration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,

    /// Names of services that must be ready first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Working directory override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    /// Restart policy applied after readiness failures
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Additional readiness-marker regexes for this service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_markers: Vec<String>,
}

impl ServiceSpec {
    /// Parse the declared port specifications
    pub fn port_specs(&self) -> Result<Vec<PortSpec>> {
        self.ports
            .iter()
            .map(|raw| {
                PortSpec::parse(raw, self.kind.is_containerized()).map_err(|reason| {
                    ConfigError::InvalidPortSpec {
                        service: self.name.clone(),
                        spec: raw.clone(),
                        reason,
                    }
                })
            })
            .collect()
    }

    /// The first declared port spec, which names the service's primary port
    pub fn primary_port(&self) -> Result<Option<PortSpec>> {
        Ok(self.port_specs()?.into_iter().next())
    }

    /// Effective working directory
    pub fn effective_workdir(&self) -> &PathBuf {
        self.workdir.as_ref().unwrap_or(&self.project_dir)
    }
}

/// Service execution kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Native OS process (node/python/dotnet/...)
    Native,
    /// .NET Aspire AppHost
    Aspire,
    /// Docker Compose stack treated as one unit
    Compose,
    /// Docker-driven service, also run through the compose CLI
    Docker,
}

impl ServiceKind {
    /// Whether bare port numbers mean container ports with auto host mapping
    pub fn is_containerized(&self) -> bool {
        matches!(self, ServiceKind::Compose | ServiceKind::Docker)
    }
}

/// Restart policy for a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    #[default]
    None,
    /// Restart after a non-zero exit or probe-failure error
    OnFailure,
    /// Restart whenever the child stops
    Always,
}

/// Declared health check for a service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// Explicit HTTP endpoint (absolute URL or path on the service port)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// HTTP method, default GET
    #[serde(default = "default_method")]
    pub method: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,

    /// Attempts per probe round
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Seconds between attempts within a round
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    /// Seconds after start during which failures do not count
    #[serde(default = "default_start_period")]
    pub start_period: u64,

    /// Consecutive failed rounds before the service is errored
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            endpoint: None,
            method: default_method(),
            timeout: default_probe_timeout(),
            retries: default_retries(),
            retry_interval: default_retry_interval(),
            start_period: default_start_period(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_retries() -> u32 {
    3
}
fn default_retry_interval() -> u64 {
    1
}
fn default_start_period() -> u64 {
    30
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_readiness_deadline() -> u64 {
    120
}
fn default_flexible() -> bool {
    true
}
