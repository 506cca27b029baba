//! Port assignment logic

use std::collections::HashSet;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, Utc};
use futures::lock::Mutex;
use tracing::{debug, info, warn};

use crate::store::{PortAssignment, PortStore, PortsFile};
use crate::{Error, Result};

/// Reserved assignment name for the project dashboard
pub const DASHBOARD_SERVICE: &str = "azd-app-dashboard";

/// Preferred dashboard port
pub const DASHBOARD_PORT: u16 = 3100;

/// Lowest port considered when a flexible scan wraps around
const SCAN_FLOOR: u16 = 1024;

/// Default time-to-live for assignments of services no longer alive
const DEFAULT_TTL_DAYS: i64 = 30;

/// Callback resolving a service name to its live registered PID, if any
pub type LivenessProbe = Box<dyn Fn(&str) -> Option<u32> + Send + Sync>;

/// Per-project port authority
///
/// One instance per absolute project directory. In-process callers are
/// serialized by an internal mutex; other processes by the store's file
/// lock.
pub struct PortManager {
    project_dir: PathBuf,
    store: PortStore,
    // Serializes the load-probe-save cycle within this process.
    assign_lock: Mutex<()>,
    ttl: ChronoDuration,
    liveness: Option<LivenessProbe>,
}

impl PortManager {
    /// Create a manager for a project directory
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        let project_dir = project_dir.as_ref().to_path_buf();
        Self {
            store: PortStore::new(&project_dir),
            project_dir,
            assign_lock: Mutex::new(()),
            ttl: ChronoDuration::days(DEFAULT_TTL_DAYS),
            liveness: None,
        }
    }

    /// Install a registry-backed liveness probe used for pruning and reuse
    pub fn with_liveness(mut self, probe: LivenessProbe) -> Self {
        self.liveness = Some(probe);
        self
    }

    /// Override the assignment time-to-live
    pub fn with_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The project this manager serves
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Assign a port for `service`
    ///
    /// Returns `(port, was_explicit)`. Tie-breaks: an exact requested port
    /// wins over history; history wins over a fresh scan.
    pub async fn assign(
        &self,
        service: &str,
        preferred: u16,
        is_explicit: bool,
        flexible: bool,
    ) -> Result<(u16, bool)> {
        let _guard = self.assign_lock.lock().await;
        let lock = self.store.lock()?;
        let mut file = self.store.load(&lock)?;

        self.prune(&mut file);

        // Ports already promised to other services in this project.
        let reserved: HashSet<u16> = file
            .assignments
            .values()
            .filter(|a| a.service_name != service)
            .map(|a| a.port)
            .collect();

        // History: reuse the previous port when the caller did not insist on
        // a different one.
        if let Some(existing) = file.assignments.get(service).cloned() {
            if preferred == 0 || existing.port == preferred {
                if port_free(existing.port) {
                    let port = existing.port;
                    let was_explicit = existing.is_explicit || is_explicit;
                    self.record(&mut file, service, port, was_explicit);
                    self.store.save(&lock, &file)?;
                    debug!(service, port, "reusing recorded port");
                    return Ok((port, was_explicit));
                }
                // The port is busy; if the occupant is this very service
                // (still registered from a previous run), keep the number.
                if let Some(live_pid) = self.live_pid(service) {
                    if occupant_pid(existing.port) == Some(live_pid) {
                        let port = existing.port;
                        self.record(&mut file, service, port, existing.is_explicit);
                        self.store.save(&lock, &file)?;
                        debug!(service, port, pid = live_pid, "port held by same service");
                        return Ok((port, existing.is_explicit));
                    }
                }
            }
        }

        // Exact request.
        if preferred > 0 && !reserved.contains(&preferred) && port_free(preferred) {
            self.record(&mut file, service, preferred, is_explicit);
            self.store.save(&lock, &file)?;
            debug!(service, port = preferred, "assigned requested port");
            return Ok((preferred, is_explicit));
        }

        if preferred > 0 && !flexible {
            let occupant = occupant_pid(preferred);
            warn!(
                service,
                port = preferred,
                ?occupant,
                "requested port is busy and service is not flexible"
            );
            return Err(Error::PortInUse {
                service: service.to_string(),
                port: preferred,
                occupant_pid: occupant,
            });
        }

        // Flexible scan: preferred+1 up to 65535, wrapping into 1024..preferred.
        let start = if preferred > 0 {
            preferred.saturating_add(1)
        } else {
            SCAN_FLOOR
        };
        let port = scan_free_port(start, preferred, &reserved).ok_or(Error::Exhausted {
            service: service.to_string(),
            start,
        })?;

        // A scanned port was never pinned by the manifest.
        self.record(&mut file, service, port, false);
        self.store.save(&lock, &file)?;
        info!(service, port, "assigned scanned port");
        Ok((port, false))
    }

    /// Assign the reserved dashboard port (always flexible)
    pub async fn assign_dashboard(&self, preferred: Option<u16>) -> Result<u16> {
        let preferred = preferred.unwrap_or(DASHBOARD_PORT);
        let (port, _) = self.assign(DASHBOARD_SERVICE, preferred, false, true).await?;
        Ok(port)
    }

    /// Drop the assignment for `service`
    pub async fn release(&self, service: &str) -> Result<()> {
        let _guard = self.assign_lock.lock().await;
        let lock = self.store.lock()?;
        let mut file = self.store.load(&lock)?;
        if file.assignments.remove(service).is_some() {
            self.store.save(&lock, &file)?;
            debug!(service, "released port assignment");
        }
        Ok(())
    }

    /// Snapshot of the recorded assignments
    pub async fn load_assignments(&self) -> Result<PortsFile> {
        let _guard = self.assign_lock.lock().await;
        let lock = self.store.lock()?;
        self.store.load(&lock)
    }

    fn record(&self, file: &mut PortsFile, service: &str, port: u16, is_explicit: bool) {
        file.assignments.insert(
            service.to_string(),
            PortAssignment {
                service_name: service.to_string(),
                port,
                is_explicit,
                last_used_at: Utc::now(),
            },
        );
    }

    /// Drop assignments past their TTL whose service is no longer alive
    fn prune(&self, file: &mut PortsFile) {
        let cutoff = Utc::now() - self.ttl;
        file.assignments.retain(|service, assignment| {
            let expired = assignment.last_used_at < cutoff;
            let keep = !expired || self.live_pid(service).is_some();
            if !keep {
                debug!(service, port = assignment.port, "pruning expired assignment");
            }
            keep
        });
    }

    fn live_pid(&self, service: &str) -> Option<u32> {
        self.liveness.as_ref().and_then(|probe| probe(service))
    }
}

/// Bind-and-release probe on the loopback interface
fn port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// First free, unreserved port scanning upward from `start`
///
/// Wraps into the 1024..preferred range so a request near the top of the
/// space still finds room.
fn scan_free_port(start: u16, preferred: u16, reserved: &HashSet<u16>) -> Option<u16> {
    let upward = start..=u16::MAX;
    let wrapped = SCAN_FLOOR..preferred.max(SCAN_FLOOR);
    upward
        .chain(wrapped)
        .find(|port| !reserved.contains(port) && port_free(*port))
}

/// Best-effort PID discovery for whatever currently holds `port`
fn occupant_pid(port: u16) -> Option<u32> {
    let output = std::process::Command::new("lsof")
        .arg("-ti")
        .arg(format!(":{}", port))
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}
