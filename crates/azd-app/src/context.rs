//! CLI-side wiring of the shared run context

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use command_executor::process::pid_alive;
use port_manager::PortManager;
use service_orchestration::RunContext;
use service_registry::{models::entry_key, Registry, RegistryStore};

/// Resolve and canonicalize the project directory
pub fn project_dir(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("project directory '{}' not found", path.display()))
}

/// The manifest file inside a project directory
pub fn manifest_path(project_dir: &Path) -> PathBuf {
    project_dir.join("azure.yaml")
}

/// Build the run context shared by every command
///
/// The port manager gets a registry-backed liveness probe so assignment
/// pruning and same-service reuse can see which PIDs are actually running.
pub fn run_context(project_dir: &Path) -> RunContext {
    let store = RegistryStore::new();
    let registry = Arc::new(Registry::with_store(store.clone()));

    let liveness_dir = project_dir.to_path_buf();
    let liveness = Box::new(move |service: &str| {
        let key = entry_key(&liveness_dir, service);
        store
            .read()
            .ok()
            .and_then(|map| map.get(&key).map(|entry| entry.pid))
            .filter(|pid| pid_alive(*pid))
    });

    let ports = Arc::new(PortManager::new(project_dir).with_liveness(liveness));

    RunContext::new(project_dir)
        .with_registry(registry)
        .with_ports(ports)
}
