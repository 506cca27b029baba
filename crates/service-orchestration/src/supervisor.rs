//! Per-service supervisor: one owner for one service's lifecycle

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use app_config::{RestartPolicy, ServiceSpec};
use async_io::Timer;
use command_executor::{
    executor::LineMonitor, CancelToken, Command, Executor, ExitStatus, ProcessHandle,
    ProcessEventType,
};
use futures::StreamExt;
use futures_lite::future;
use health_checker::HealthCheckResult;
use log_multiplexer::LogStream;
use rand::Rng;
use service_registry::{HealthState, ServiceEntry, ServiceStatus};
use tracing::{debug, info, warn};

use crate::command::resolve_command;
use crate::context::RunContext;
use crate::ready::ReadyMatcher;
use crate::{Error, Result};

/// Pause between readiness probes while waiting for the first healthy result
const PROBING_INTERVAL: Duration = Duration::from_millis(250);

/// Pause between steady-state probe rounds
const STEADY_INTERVAL: Duration = Duration::from_secs(5);

/// Restart back-off base, cap and attempt budget
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const RESTART_MAX_ATTEMPTS: usize = 5;
const RESTART_WINDOW: Duration = Duration::from_secs(600);

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Created, nothing resolved yet
    Idle,
    /// Ports assigned, command being resolved
    Planning,
    /// Child being spawned
    Starting,
    /// Child up, waiting for readiness
    Probing,
    /// Readiness achieved
    Ready,
    /// Shutdown in progress
    Stopping,
    /// Child exited after a stop
    Stopped,
    /// Startup or supervision failed terminally
    Errored,
}

impl SupervisorState {
    /// Mapping onto the registry status domain
    pub fn registry_status(self) -> Option<ServiceStatus> {
        match self {
            SupervisorState::Idle | SupervisorState::Planning => None,
            SupervisorState::Starting | SupervisorState::Probing => Some(ServiceStatus::Starting),
            SupervisorState::Ready => Some(ServiceStatus::Ready),
            SupervisorState::Stopping => Some(ServiceStatus::Stopping),
            SupervisorState::Stopped => Some(ServiceStatus::Stopped),
            SupervisorState::Errored => Some(ServiceStatus::Error),
        }
    }
}

/// Status notification emitted on every state transition
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// The service this event belongs to
    pub service: String,
    /// The state entered
    pub state: SupervisorState,
    /// Error context for `Errored`
    pub error: Option<String>,
}

/// Owns one service across its full lifecycle
pub struct Supervisor {
    spec: ServiceSpec,
    ctx: RunContext,
    port: u16,
    readiness_deadline: Duration,
    stop_grace: Duration,
    /// Per-service stop request (orchestrated shutdown)
    stop_token: CancelToken,
    status_tx: async_channel::Sender<StatusEvent>,
}

impl Supervisor {
    /// Create a supervisor and the receiving end of its status stream
    pub fn new(
        spec: ServiceSpec,
        ctx: RunContext,
        port: u16,
        readiness_deadline: Duration,
        stop_grace: Duration,
    ) -> (Self, CancelToken, async_channel::Receiver<StatusEvent>) {
        let (status_tx, status_rx) = async_channel::unbounded();
        let stop_token = CancelToken::new();
        (
            Self {
                spec,
                ctx,
                port,
                readiness_deadline,
                stop_grace,
                stop_token: stop_token.clone(),
                status_tx,
            },
            stop_token,
            status_rx,
        )
    }

    /// The service this supervisor owns
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Drive the service until it is stopped or errored
    pub async fn run(self) {
        self.emit(SupervisorState::Planning, None).await;

        let cmd = match resolve_command(&self.spec, self.port) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(service = %self.spec.name, "planning failed: {}", e);
                self.register_failure(&e.to_string()).await;
                self.emit(SupervisorState::Errored, Some(e.to_string())).await;
                return;
            }
        };

        let mut restarts = RestartTracker::new();
        loop {
            let outcome = match self.run_once(cmd.clone()).await {
                Ok(outcome) => outcome,
                Err(e) => Outcome::Failed(e.to_string()),
            };

            match outcome {
                Outcome::Stopped => {
                    self.emit(SupervisorState::Stopped, None).await;
                    return;
                }
                Outcome::ExitedZero => {
                    if self.spec.restart == RestartPolicy::Always {
                        if let Some(delay) = restarts.next_delay() {
                            if self.backoff(delay).await {
                                continue;
                            }
                            // Stop requested during back-off.
                            self.emit(SupervisorState::Stopped, None).await;
                            return;
                        }
                        self.emit(
                            SupervisorState::Errored,
                            Some("restart attempts exhausted".to_string()),
                        )
                        .await;
                        return;
                    }
                    info!(service = %self.spec.name, "exited cleanly");
                    self.emit(SupervisorState::Stopped, None).await;
                    return;
                }
                Outcome::Failed(reason) => {
                    let restartable = matches!(
                        self.spec.restart,
                        RestartPolicy::OnFailure | RestartPolicy::Always
                    );
                    if restartable && !self.stop_requested() {
                        if let Some(delay) = restarts.next_delay() {
                            warn!(
                                service = %self.spec.name,
                                "failed ({}), restarting in {:?}", reason, delay
                            );
                            if self.backoff(delay).await {
                                continue;
                            }
                            self.emit(SupervisorState::Stopped, None).await;
                            return;
                        }
                        let reason = format!("restart attempts exhausted after: {}", reason);
                        self.register_failure(&reason).await;
                        self.emit(SupervisorState::Errored, Some(reason)).await;
                        return;
                    }
                    self.register_failure(&reason).await;
                    self.emit(SupervisorState::Errored, Some(reason)).await;
                    return;
                }
            }
        }
    }

    /// One spawn-to-exit pass
    async fn run_once(&self, cmd: Command) -> Result<Outcome> {
        self.emit(SupervisorState::Starting, None).await;

        // Ready markers are detected inside the output monitor; the flag
        // backs up the channel in case the notification was already taken.
        let matcher = ReadyMatcher::for_service(&self.spec);
        let marker_seen = Arc::new(AtomicBool::new(false));
        let (marker_tx, marker_rx) = async_channel::bounded::<()>(1);
        let monitor: LineMonitor = {
            let marker_seen = marker_seen.clone();
            Arc::new(move |_stream, line: &str| {
                if !marker_seen.load(Ordering::Relaxed) && matcher.matches(line) {
                    marker_seen.store(true, Ordering::Relaxed);
                    let _ = marker_tx.try_send(());
                }
            })
        };

        let executor = Executor::new(self.spec.name.clone());
        let (events, mut handle) = executor.spawn_monitored(cmd, monitor)?;
        let pid = handle.pid();
        info!(service = %self.spec.name, pid, port = self.port, "child started");

        // Pump child output into the shared multiplexer.
        let pump = {
            let logs = self.ctx.logs.clone();
            let name = self.spec.name.clone();
            smol::spawn(async move {
                futures::pin_mut!(events);
                while let Some(event) = events.next().await {
                    let line = event.data.as_deref().unwrap_or_default();
                    match event.event_type {
                        ProcessEventType::Stdout => logs.ingest(&name, LogStream::Stdout, line),
                        ProcessEventType::Stderr => logs.ingest(&name, LogStream::Stderr, line),
                        _ => {}
                    }
                }
            })
        };

        let entry = ServiceEntry::new(&self.ctx.project_dir, &self.spec.name, pid)
            .with_port(self.port)
            .with_language(self.spec.language.clone())
            .with_framework(self.spec.framework.clone());
        self.ctx.registry.register(entry.clone()).await?;

        self.emit(SupervisorState::Probing, None).await;

        match self
            .await_readiness(&entry, &mut handle, &marker_rx, &marker_seen)
            .await?
        {
            ReadinessOutcome::Ready(health) => {
                self.emit(SupervisorState::Ready, None).await;
                let _ = self
                    .ctx
                    .registry
                    .update_status(
                        &self.ctx.project_dir,
                        &self.spec.name,
                        ServiceStatus::Ready,
                        health,
                        None,
                    )
                    .await;
            }
            ReadinessOutcome::Stop => return self.stop_child(&mut handle, pump).await,
            ReadinessOutcome::Exited(exit) => {
                let _ = self.drain_pump(pump).await;
                return Ok(Outcome::Failed(format!(
                    "exited before readiness (code {:?}, signal {:?})",
                    exit.code, exit.signal
                )));
            }
            ReadinessOutcome::DeadlineElapsed => {
                let _ = handle.terminate(self.stop_grace).await;
                let _ = self.drain_pump(pump).await;
                return Ok(Outcome::Failed(format!(
                    "no healthy probe or ready marker within {:?}",
                    self.readiness_deadline
                )));
            }
        }

        self.steady_state(&entry, &mut handle, pump).await
    }

    /// Probe until the service is ready, a terminal event occurs, or the
    /// deadline elapses
    async fn await_readiness(
        &self,
        entry: &ServiceEntry,
        handle: &mut ProcessHandle,
        marker_rx: &async_channel::Receiver<()>,
        marker_seen: &AtomicBool,
    ) -> Result<ReadinessOutcome> {
        let deadline = Instant::now() + self.readiness_deadline;

        loop {
            if self.stop_requested() {
                return Ok(ReadinessOutcome::Stop);
            }
            if marker_seen.load(Ordering::Relaxed) {
                debug!(service = %self.spec.name, "ready marker matched");
                return Ok(ReadinessOutcome::Ready(HealthState::Healthy));
            }
            if Instant::now() >= deadline {
                return Ok(ReadinessOutcome::DeadlineElapsed);
            }

            enum Tick {
                Marker,
                Stop,
                Exited(std::io::Result<ExitStatus>),
                Probed(Box<HealthCheckResult>),
            }

            let tick = {
                let marker = async {
                    match marker_rx.recv().await {
                        Ok(()) => Tick::Marker,
                        // Channel closed just means the child's output ended;
                        // the exit branch reports that.
                        Err(_) => future::pending().await,
                    }
                };
                let stop = async {
                    self.stopped_signal().await;
                    Tick::Stop
                };
                let probe = async {
                    Timer::after(PROBING_INTERVAL).await;
                    let result = self
                        .ctx
                        .health
                        .check_service(entry, self.spec.health_check.as_ref())
                        .await;
                    Tick::Probed(Box::new(result))
                };
                let exited = async {
                    let result = handle.wait().await;
                    Tick::Exited(result.map_err(std::io::Error::other))
                };
                future::or(marker, future::or(stop, future::or(exited, probe))).await
            };

            match tick {
                Tick::Marker => {
                    debug!(service = %self.spec.name, "ready marker matched");
                    return Ok(ReadinessOutcome::Ready(HealthState::Healthy));
                }
                Tick::Stop => return Ok(ReadinessOutcome::Stop),
                Tick::Exited(result) => {
                    let exit = result.map_err(|e| Error::ServiceFailed {
                        name: self.spec.name.clone(),
                        reason: e.to_string(),
                    })?;
                    return Ok(ReadinessOutcome::Exited(exit));
                }
                Tick::Probed(result) => {
                    if result.status == HealthState::Healthy {
                        debug!(service = %self.spec.name, "first healthy probe");
                        return Ok(ReadinessOutcome::Ready(HealthState::Healthy));
                    }
                    // Not ready yet; loop and try again.
                }
            }
        }
    }

    /// Ready service: periodic probing, failure counting, exit watching
    async fn steady_state(
        &self,
        entry: &ServiceEntry,
        handle: &mut ProcessHandle,
        pump: smol::Task<()>,
    ) -> Result<Outcome> {
        let threshold = self
            .spec
            .health_check
            .as_ref()
            .map(|h| h.failure_threshold)
            .unwrap_or(3)
            .max(1);
        let mut consecutive_failures = 0u32;
        let mut probing = false;

        loop {
            enum Tick {
                Stop,
                Exited(std::io::Result<Option<ExitStatus>>),
            }

            let tick = {
                let stop = async {
                    self.stopped_signal().await;
                    Tick::Stop
                };
                let wait = async {
                    let result = handle.wait_timeout(STEADY_INTERVAL).await;
                    Tick::Exited(result.map_err(std::io::Error::other))
                };
                future::or(stop, wait).await
            };

            match tick {
                Tick::Stop => return self.stop_child(handle, pump).await,
                Tick::Exited(Ok(Some(exit))) => {
                    let _ = self.drain_pump(pump).await;
                    return if exit.code == Some(0) {
                        Ok(Outcome::ExitedZero)
                    } else {
                        Ok(Outcome::Failed(format!(
                            "exited unexpectedly (code {:?}, signal {:?})",
                            exit.code, exit.signal
                        )))
                    };
                }
                Tick::Exited(Err(e)) => {
                    let _ = self.drain_pump(pump).await;
                    return Ok(Outcome::Failed(format!("wait failed: {}", e)));
                }
                Tick::Exited(Ok(None)) => {
                    // Interval elapsed; run a probe round.
                    let result = self
                        .ctx
                        .health
                        .check_service(entry, self.spec.health_check.as_ref())
                        .await;

                    let _ = self
                        .ctx
                        .registry
                        .update_health(
                            &self.ctx.project_dir,
                            &self.spec.name,
                            result.status,
                            result.error.clone(),
                        )
                        .await;

                    match result.status {
                        HealthState::Healthy => {
                            if probing {
                                debug!(service = %self.spec.name, "probe recovered");
                                self.emit(SupervisorState::Ready, None).await;
                                probing = false;
                            }
                            consecutive_failures = 0;
                        }
                        HealthState::Unhealthy => {
                            if !probing {
                                self.emit(SupervisorState::Probing, None).await;
                                probing = true;
                            }
                            let in_grace = self
                                .ctx
                                .health
                                .in_start_period(entry, self.spec.health_check.as_ref());
                            if !in_grace {
                                consecutive_failures += 1;
                                debug!(
                                    service = %self.spec.name,
                                    consecutive_failures, threshold, "probe failed"
                                );
                                if consecutive_failures >= threshold {
                                    let _ = handle.terminate(self.stop_grace).await;
                                    let _ = self.drain_pump(pump).await;
                                    return Ok(Outcome::Failed(format!(
                                        "{} consecutive failed probes: {}",
                                        consecutive_failures,
                                        result.error.unwrap_or_default()
                                    )));
                                }
                            }
                        }
                        HealthState::Degraded | HealthState::Unknown => {
                            // Not counted toward the threshold.
                        }
                    }
                }
            }
        }
    }

    /// Graceful stop: SIGTERM, grace, SIGKILL, registry cleanup
    async fn stop_child(&self, handle: &mut ProcessHandle, pump: smol::Task<()>) -> Result<Outcome> {
        self.emit(SupervisorState::Stopping, None).await;
        let _ = self
            .ctx
            .registry
            .update_status(
                &self.ctx.project_dir,
                &self.spec.name,
                ServiceStatus::Stopping,
                HealthState::Unknown,
                None,
            )
            .await;

        let exit = handle.terminate(self.stop_grace).await;
        debug!(service = %self.spec.name, ?exit, "child stopped");
        let _ = self.drain_pump(pump).await;

        let _ = self
            .ctx
            .registry
            .update_status(
                &self.ctx.project_dir,
                &self.spec.name,
                ServiceStatus::Stopped,
                HealthState::Unknown,
                None,
            )
            .await;
        Ok(Outcome::Stopped)
    }

    /// Let the output pump finish reading EOF'd pipes, bounded
    async fn drain_pump(&self, pump: smol::Task<()>) -> bool {
        let done = async {
            pump.await;
            true
        };
        let timeout = async {
            Timer::after(Duration::from_secs(2)).await;
            false
        };
        future::or(done, timeout).await
    }

    /// Sleep through a restart back-off; true to proceed with the restart
    async fn backoff(&self, delay: Duration) -> bool {
        let slept = async {
            Timer::after(delay).await;
            true
        };
        let interrupted = async {
            self.stopped_signal().await;
            false
        };
        future::or(slept, interrupted).await
    }

    fn stop_requested(&self) -> bool {
        self.stop_token.is_cancelled() || self.ctx.cancel.is_cancelled()
    }

    async fn stopped_signal(&self) {
        let own = self.stop_token.cancelled();
        let global = self.ctx.cancel.cancelled();
        future::or(own, global).await
    }

    /// Record a terminal failure in the registry, creating the entry if the
    /// failure happened before registration
    async fn register_failure(&self, reason: &str) {
        let result = self
            .ctx
            .registry
            .update_status(
                &self.ctx.project_dir,
                &self.spec.name,
                ServiceStatus::Error,
                HealthState::Unhealthy,
                Some(reason.to_string()),
            )
            .await;
        if result.is_err() {
            let mut entry = ServiceEntry::new(&self.ctx.project_dir, &self.spec.name, 0);
            entry.status = ServiceStatus::Error;
            entry.health = HealthState::Unhealthy;
            entry.last_error = Some(reason.to_string());
            let _ = self.ctx.registry.register(entry).await;
        }
    }

    async fn emit(&self, state: SupervisorState, error: Option<String>) {
        let _ = self
            .status_tx
            .send(StatusEvent {
                service: self.spec.name.clone(),
                state,
                error,
            })
            .await;
    }
}

enum ReadinessOutcome {
    Ready(HealthState),
    Stop,
    Exited(ExitStatus),
    DeadlineElapsed,
}

enum Outcome {
    Stopped,
    ExitedZero,
    Failed(String),
}

/// Sliding-window restart budget with jittered exponential back-off
struct RestartTracker {
    attempts: VecDeque<Instant>,
}

impl RestartTracker {
    fn new() -> Self {
        Self {
            attempts: VecDeque::new(),
        }
    }

    /// Next back-off delay, or `None` once the window budget is spent
    fn next_delay(&mut self) -> Option<Duration> {
        let now = Instant::now();
        while let Some(front) = self.attempts.front() {
            if now.duration_since(*front) > RESTART_WINDOW {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        if self.attempts.len() >= RESTART_MAX_ATTEMPTS {
            return None;
        }

        let exponent = self.attempts.len() as u32;
        self.attempts.push_back(now);

        let base = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(BACKOFF_CAP);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Some(base.mul_f64(jitter))
    }
}
