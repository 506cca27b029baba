//! # Service orchestration
//!
//! The supervisor/orchestrator pair at the heart of azd-app: one supervisor
//! owns one service's full lifecycle (spawn, wait-ready, steady-state
//! probing, restarts, stop), while the orchestrator turns a manifest into
//! dependency-ordered waves of supervisors, watches their status streams and
//! tears everything down cleanly on interrupt or failure.
//!
//! Components communicate exclusively through explicit handles injected by
//! the orchestrator: the registry, the port manager, the log multiplexer and
//! the health checker are created once per run and shared by reference.

#![warn(missing_docs)]

mod command;
mod context;
mod orchestrator;
mod plan;
mod ready;
mod supervisor;

pub use command::resolve_command;
pub use command_executor::CancelToken;
pub use context::RunContext;
pub use orchestrator::{
    stop_registered, Orchestrator, RunOutcome, GLOBAL_SHUTDOWN_BUDGET, STOP_GRACE,
};
pub use plan::DependencyGraph;
pub use ready::ReadyMatcher;
pub use supervisor::{StatusEvent, Supervisor, SupervisorState};

/// Error types for orchestration operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The dependency graph contains a cycle
    #[error("dependency cycle between services: {0:?}")]
    DependencyCycle(Vec<String>),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Service not found in the manifest
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Manifest model errors
    #[error(transparent)]
    Manifest(#[from] app_config::ConfigError),

    /// Service registry errors
    #[error("service registry error: {0}")]
    Registry(#[from] service_registry::Error),

    /// Port assignment errors
    #[error("port assignment error: {0}")]
    Ports(#[from] port_manager::Error),

    /// Command execution errors
    #[error("command execution error: {0}")]
    CommandExecutor(#[from] command_executor::Error),

    /// A service failed to start or run
    #[error("service '{name}' failed: {reason}")]
    ServiceFailed {
        /// The failed service
        name: String,
        /// One-line cause
        reason: String,
    },

    /// IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
