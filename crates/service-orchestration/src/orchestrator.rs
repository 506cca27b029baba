//! Manifest-driven orchestration: waves, supervision, shutdown

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use app_config::{Project, ServiceSpec, ShutdownOrder};
use async_io::Timer;
use command_executor::process::pid_alive;
use futures::future::join_all;
use futures_lite::future;
use service_registry::{HealthState, ServiceStatus};
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::plan::DependencyGraph;
use crate::supervisor::{StatusEvent, Supervisor, SupervisorState};
use crate::{Error, Result};

/// Default per-service grace between SIGTERM and SIGKILL on stop
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Hard ceiling for a whole shutdown pass
pub const GLOBAL_SHUTDOWN_BUDGET: Duration = Duration::from_secs(60);

/// What one `start` call achieved
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Services that reached ready
    pub ready: Vec<String>,
    /// Services that failed, with a one-line reason each
    pub failed: Vec<(String, String)>,
    /// True when the run was cancelled mid-flight
    pub interrupted: bool,
}

impl RunOutcome {
    /// No failures and not interrupted
    pub fn success(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }
}

struct Managed {
    port: u16,
    port_explicit: bool,
    stop: command_executor::CancelToken,
    task: Option<smol::Task<()>>,
}

/// Coordinates all supervisors for one project run
pub struct Orchestrator {
    project: Project,
    manifest_path: Option<PathBuf>,
    ctx: RunContext,
    managed: HashMap<String, Managed>,
    start_order: Vec<String>,
}

impl Orchestrator {
    /// Create an orchestrator for a loaded project
    pub fn new(project: Project, ctx: RunContext) -> Self {
        Self {
            project,
            manifest_path: None,
            ctx,
            managed: HashMap::new(),
            start_order: Vec::new(),
        }
    }

    /// Enable manifest writeback of auto-assigned ports
    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    /// Shared run context
    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Bring services up in dependency waves
    ///
    /// With a `filter`, only the named services and their transitive
    /// dependencies take part. Configuration problems (unknown names,
    /// cycles, bad port specs) fail here, before anything is spawned.
    pub async fn start(&mut self, filter: Option<&[String]>) -> Result<RunOutcome> {
        let specs = self.select_services(filter)?;
        let graph = DependencyGraph::from_services(specs.iter());
        let waves = graph.waves()?;
        let orchestration = self.project.orchestrator();
        let readiness_deadline = Duration::from_secs(orchestration.readiness_deadline);

        info!(
            project = %self.project.name,
            services = specs.len(),
            waves = waves.len(),
            "starting services"
        );

        // Ports for every service are reserved before the first wave runs,
        // so a later wave cannot lose its pinned port to an earlier one. A
        // port that cannot be acquired fails that one service, not the run.
        let specs_by_name: HashMap<String, ServiceSpec> =
            specs.iter().map(|s| (s.name.clone(), s.clone())).collect();
        let mut outcome = RunOutcome::default();
        let mut ready: HashSet<String> = HashSet::new();
        let mut failed: HashMap<String, String> = HashMap::new();
        let mut ports: HashMap<String, (u16, bool)> = HashMap::new();
        for name in graph.topological_order()? {
            let spec = &specs_by_name[&name];
            match self.acquire_port(spec).await {
                Ok(assigned) => {
                    ports.insert(name.clone(), assigned);
                }
                Err(e) => {
                    warn!(service = %name, "port acquisition failed: {}", e);
                    if orchestration.fail_fast {
                        return Err(e);
                    }
                    failed.insert(name.clone(), e.to_string());
                    outcome.failed.push((name.clone(), e.to_string()));
                }
            }
        }

        'waves: for wave in &waves {
            let mut waiting = Vec::new();

            for name in wave {
                let spec = &specs_by_name[name];

                // Failed port acquisition was already reported.
                if failed.contains_key(name) {
                    continue;
                }

                if let Some(dep) = graph
                    .dependencies_of(name)
                    .iter()
                    .find(|dep| failed.contains_key(*dep))
                {
                    let reason = format!("dependency '{}' failed", dep);
                    warn!(service = %name, "{}", reason);
                    failed.insert(name.clone(), reason.clone());
                    outcome.failed.push((name.clone(), reason));
                    continue;
                }

                // Idempotence: a service already ready under a live pid is
                // left alone.
                if let Ok(Some(entry)) = self
                    .ctx
                    .registry
                    .get_service(&self.ctx.project_dir, name)
                    .await
                {
                    if entry.status == ServiceStatus::Ready && pid_alive(entry.pid) {
                        info!(service = %name, pid = entry.pid, "already running, skipping");
                        ready.insert(name.clone());
                        outcome.ready.push(name.clone());
                        continue;
                    }
                }

                let (port, port_explicit) = ports[name];
                let (supervisor, stop, status_rx) = Supervisor::new(
                    spec.clone(),
                    self.ctx.clone(),
                    port,
                    readiness_deadline,
                    STOP_GRACE,
                );
                let task = smol::spawn(supervisor.run());
                self.managed.insert(
                    name.clone(),
                    Managed {
                        port,
                        port_explicit,
                        stop,
                        task: Some(task),
                    },
                );
                self.start_order.push(name.clone());
                waiting.push((name.clone(), status_rx));
            }

            // A wave completes when every member is ready or has errored.
            let results = join_all(
                waiting
                    .into_iter()
                    .map(|(name, rx)| async move { (name, wait_for_terminal(rx).await) }),
            )
            .await;

            for (name, result) in results {
                match result {
                    WaveResult::Ready => {
                        ready.insert(name.clone());
                        outcome.ready.push(name);
                    }
                    WaveResult::Errored(reason) => {
                        failed.insert(name.clone(), reason.clone());
                        outcome.failed.push((name, reason));
                        if orchestration.fail_fast {
                            warn!("fail-fast: aborting remaining waves");
                            self.ctx.cancel.cancel();
                            break 'waves;
                        }
                    }
                    WaveResult::Stopped => {
                        outcome.interrupted = true;
                    }
                }
            }

            if self.ctx.cancel.is_cancelled() {
                outcome.interrupted = true;
                break 'waves;
            }
        }

        if outcome.interrupted || (orchestration.fail_fast && !outcome.failed.is_empty()) {
            self.shutdown().await?;
        }

        Ok(outcome)
    }

    /// Stop every supervised service and release run resources
    ///
    /// Reverse-topological by default; `parallel` stops everything at once.
    /// Each service gets the per-service grace, the pass as a whole is
    /// clamped by [`GLOBAL_SHUTDOWN_BUDGET`]; on budget exhaustion remaining
    /// supervisors are escalated through the run-wide cancel token.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.managed.is_empty() {
            return Ok(());
        }
        let order = self.project.orchestrator().shutdown_order;
        let deadline = Instant::now() + GLOBAL_SHUTDOWN_BUDGET;
        info!(services = self.managed.len(), ?order, "shutting down");

        match order {
            ShutdownOrder::Reverse => {
                let names: Vec<String> = self.start_order.iter().rev().cloned().collect();
                for name in names {
                    if let Some(managed) = self.managed.get_mut(&name) {
                        managed.stop.cancel();
                        if let Some(task) = managed.task.take() {
                            if !await_task_until(task, deadline).await {
                                warn!(service = %name, "shutdown budget exhausted, escalating");
                                self.ctx.cancel.cancel();
                            }
                        }
                    }
                }
            }
            ShutdownOrder::Parallel => {
                for managed in self.managed.values_mut() {
                    managed.stop.cancel();
                }
                let tasks: Vec<_> = self
                    .managed
                    .values_mut()
                    .filter_map(|m| m.task.take())
                    .collect();
                let all = join_all(tasks.into_iter().map(|t| async move {
                    t.await;
                }));
                let done = async {
                    all.await;
                    true
                };
                let expired = async {
                    Timer::after(GLOBAL_SHUTDOWN_BUDGET).await;
                    false
                };
                if !future::or(done, expired).await {
                    warn!("shutdown budget exhausted, escalating");
                    self.ctx.cancel.cancel();
                }
            }
        }

        // Registry and port cleanup after the children are gone.
        for (name, managed) in self.managed.drain() {
            let _ = self
                .ctx
                .registry
                .unregister(&self.ctx.project_dir, &name)
                .await;
            if managed.port > 0 && !managed.port_explicit {
                let _ = self.ctx.ports.release(&name).await;
            }
        }
        self.start_order.clear();

        // Flush remaining log events to whoever is still listening.
        self.ctx.logs.close();
        info!("shutdown complete");
        Ok(())
    }

    /// The requested services plus their transitive dependencies
    fn select_services(&self, filter: Option<&[String]>) -> Result<Vec<ServiceSpec>> {
        let all: HashMap<&str, &ServiceSpec> = self
            .project
            .services
            .iter()
            .map(|s| (s.name.as_str(), s))
            .collect();

        let selected: Vec<&ServiceSpec> = match filter {
            None => self.project.services.iter().collect(),
            Some(names) => {
                let mut keep: HashSet<&str> = HashSet::new();
                let mut stack: Vec<&str> = Vec::new();
                for name in names {
                    let spec = all
                        .get(name.as_str())
                        .ok_or_else(|| Error::ServiceNotFound(name.clone()))?;
                    if keep.insert(spec.name.as_str()) {
                        stack.push(spec.name.as_str());
                    }
                }
                while let Some(name) = stack.pop() {
                    for dep in &all[name].depends_on {
                        if let Some(spec) = all.get(dep.as_str()) {
                            if keep.insert(spec.name.as_str()) {
                                stack.push(spec.name.as_str());
                            }
                        }
                    }
                }
                self.project
                    .services
                    .iter()
                    .filter(|s| keep.contains(s.name.as_str()))
                    .collect()
            }
        };

        Ok(selected.into_iter().cloned().collect())
    }

    /// Assign the service's primary port and write auto-moves back into the
    /// manifest
    async fn acquire_port(&self, spec: &ServiceSpec) -> Result<(u16, bool)> {
        let Some(primary) = spec.primary_port()? else {
            return Ok((0, false));
        };

        let (port, explicit) = self
            .ctx
            .ports
            .assign(
                &spec.name,
                primary.host_port,
                primary.is_explicit(),
                spec.flexible,
            )
            .await?;

        if port != primary.host_port {
            debug!(service = %spec.name, from = primary.host_port, to = port, "port moved");
            if let Some(path) = &self.manifest_path {
                let containerized = spec.kind.is_containerized();
                let mut rendered: Vec<String> = Vec::new();
                for (i, parsed) in spec.port_specs()?.iter().enumerate() {
                    if i == 0 {
                        rendered.push(parsed.reassigned(port, containerized).render(containerized));
                    } else {
                        rendered.push(parsed.render(containerized));
                    }
                }
                if let Err(e) = app_config::writeback::write_ports_back(path, &spec.name, &rendered)
                {
                    warn!(service = %spec.name, "manifest writeback failed: {}", e);
                }
            }
        }

        Ok((port, explicit))
    }
}

enum WaveResult {
    Ready,
    Errored(String),
    Stopped,
}

/// Follow one supervisor's status stream to a wave-terminal state
async fn wait_for_terminal(rx: async_channel::Receiver<StatusEvent>) -> WaveResult {
    loop {
        match rx.recv().await {
            Ok(StatusEvent {
                state: SupervisorState::Ready,
                ..
            }) => return WaveResult::Ready,
            Ok(StatusEvent {
                state: SupervisorState::Errored,
                error,
                ..
            }) => return WaveResult::Errored(error.unwrap_or_else(|| "unknown failure".into())),
            Ok(StatusEvent {
                state: SupervisorState::Stopped,
                ..
            }) => return WaveResult::Stopped,
            Ok(_) => continue,
            Err(_) => return WaveResult::Stopped,
        }
    }
}

async fn await_task_until(task: smol::Task<()>, deadline: Instant) -> bool {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let done = async {
        task.await;
        true
    };
    let expired = async {
        Timer::after(remaining).await;
        false
    };
    future::or(done, expired).await
}

/// Stop services registered by a previous invocation of this project
///
/// `azd app stop` may run in a different process than the one supervising
/// the children, so this works purely from the registry: SIGTERM, grace,
/// SIGKILL, then registry and port cleanup. Stopping an already stopped
/// service succeeds without touching anything.
pub async fn stop_registered(
    ctx: &RunContext,
    filter: Option<&[String]>,
    grace: Duration,
) -> Result<Vec<String>> {
    let entries = ctx.registry.list_by_project(&ctx.project_dir).await?;
    let mut stopped = Vec::new();

    for entry in entries {
        if let Some(names) = filter {
            if !names.contains(&entry.name) {
                continue;
            }
        }
        if entry.status == ServiceStatus::Stopped || !pid_alive(entry.pid) {
            debug!(service = %entry.name, "already stopped");
            let _ = ctx.registry.unregister(&ctx.project_dir, &entry.name).await;
            stopped.push(entry.name);
            continue;
        }

        info!(service = %entry.name, pid = entry.pid, "stopping");
        let _ = ctx
            .registry
            .update_status(
                &ctx.project_dir,
                &entry.name,
                ServiceStatus::Stopping,
                HealthState::Unknown,
                None,
            )
            .await;

        terminate_pid(entry.pid, grace).await;

        let _ = ctx
            .registry
            .update_status(
                &ctx.project_dir,
                &entry.name,
                ServiceStatus::Stopped,
                HealthState::Unknown,
                None,
            )
            .await;
        let _ = ctx.registry.unregister(&ctx.project_dir, &entry.name).await;
        let _ = ctx.ports.release(&entry.name).await;
        stopped.push(entry.name);
    }

    Ok(stopped)
}

/// SIGTERM, wait up to `grace`, then SIGKILL
async fn terminate_pid(pid: u32, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let target = Pid::from_raw(pid as i32);
        let _ = signal::kill(target, Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !pid_alive(pid) {
                return;
            }
            Timer::after(Duration::from_millis(100)).await;
        }
        let _ = signal::kill(target, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }
}
