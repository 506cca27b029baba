//! Shared handles for one orchestrator run

use std::path::{Path, PathBuf};
use std::sync::Arc;

use command_executor::CancelToken;
use health_checker::HealthChecker;
use log_multiplexer::LogMultiplexer;
use port_manager::PortManager;
use service_registry::Registry;

/// Everything a supervisor needs, created once per run and injected
///
/// No component reaches for process-global state; tests build a fresh
/// context per case with stores under a temp directory.
#[derive(Clone)]
pub struct RunContext {
    /// Absolute project directory
    pub project_dir: PathBuf,
    /// Cross-process service index
    pub registry: Arc<Registry>,
    /// Per-project port authority
    pub ports: Arc<PortManager>,
    /// Shared log fan-out
    pub logs: Arc<LogMultiplexer>,
    /// Probe engine
    pub health: Arc<HealthChecker>,
    /// Run-wide cancellation, cascaded into every child
    pub cancel: CancelToken,
}

impl RunContext {
    /// Build a context with fresh default components
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        let project_dir = project_dir.as_ref().to_path_buf();
        Self {
            registry: Arc::new(Registry::new()),
            ports: Arc::new(PortManager::new(&project_dir)),
            logs: Arc::new(LogMultiplexer::new()),
            health: Arc::new(HealthChecker::new()),
            cancel: CancelToken::new(),
            project_dir,
        }
    }

    /// Replace the registry (tests point it at a scratch store)
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the port manager (the CLI wires in registry-backed liveness)
    pub fn with_ports(mut self, ports: Arc<PortManager>) -> Self {
        self.ports = ports;
        self
    }

    /// Replace the health checker
    pub fn with_health(mut self, health: Arc<HealthChecker>) -> Self {
        self.health = health;
        self
    }
}
