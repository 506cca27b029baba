//! Handles for long-running child processes

use std::time::Duration;

use async_io::Timer;
use async_process::Child;
use futures_lite::future;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Process exit status
#[derive(Debug, Clone, Copy)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process (Unix only)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns true if the process was terminated by a signal
    pub fn terminated_by_signal(&self) -> bool {
        self.signal.is_some()
    }

    pub(crate) fn from_std(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
            #[cfg(not(unix))]
            signal: None,
        }
    }
}

/// A handle to control a running child process
///
/// The handle owns the child; the matching event stream owns its piped
/// stdout/stderr. Dropping the handle does not kill the child; supervisors
/// are expected to call [`ProcessHandle::terminate`] on shutdown.
pub struct ProcessHandle {
    child: Child,
    program: String,
    /// Cached after the first successful wait
    exit: Option<ExitStatus>,
}

impl ProcessHandle {
    pub(crate) fn new(child: Child, program: String) -> Self {
        Self {
            child,
            program,
            exit: None,
        }
    }

    /// OS process id of the child
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// The program this handle was spawned from
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Wait for the process to exit and return its status
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self
            .child
            .status()
            .await
            .map_err(|e| Error::spawn_failed(format!("failed to wait for process: {}", e)))?;
        let exit = ExitStatus::from_std(status);
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Wait for the process to exit, giving up after `timeout`
    ///
    /// Returns `Ok(None)` if the process is still running when the timeout
    /// elapses.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let wait = async { self.child.status().await.map(Some) };
        let deadline = async {
            Timer::after(timeout).await;
            Ok(None)
        };
        match future::or(wait, deadline).await {
            Ok(Some(status)) => {
                let exit = ExitStatus::from_std(status);
                self.exit = Some(exit);
                Ok(Some(exit))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(Error::spawn_failed(format!(
                "failed to wait for process: {}",
                e
            ))),
        }
    }

    /// Gracefully stop the child: SIGTERM, wait up to `grace`, then SIGKILL
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        debug!(program = %self.program, pid = self.pid(), "sending SIGTERM");
        // The child may already have exited; a failed signal is not fatal.
        if let Err(e) = self.signal(Signal::Term) {
            debug!(program = %self.program, "SIGTERM not delivered: {}", e);
        }

        if let Some(exit) = self.wait_timeout(grace).await? {
            return Ok(exit);
        }

        warn!(
            program = %self.program,
            pid = self.pid(),
            "grace period expired, escalating to SIGKILL"
        );
        self.kill().await
    }

    /// Forcefully stop the child with SIGKILL and reap it
    pub async fn kill(&mut self) -> Result<ExitStatus> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        if let Err(e) = self.signal(Signal::Kill) {
            debug!(program = %self.program, "SIGKILL not delivered: {}", e);
        }
        self.wait().await
    }

    /// Send SIGINT (or the platform equivalent)
    pub fn interrupt(&mut self) -> Result<()> {
        self.signal(Signal::Int)
    }

    #[cfg(unix)]
    fn signal(&mut self, which: Signal) -> Result<()> {
        use nix::sys::signal::{self, Signal as NixSignal};
        use nix::unistd::Pid;

        let (nix_signal, num) = match which {
            Signal::Term => (NixSignal::SIGTERM, 15),
            Signal::Kill => (NixSignal::SIGKILL, 9),
            Signal::Int => (NixSignal::SIGINT, 2),
        };
        let pid = Pid::from_raw(self.child.id() as i32);
        signal::kill(pid, nix_signal).map_err(|e| Error::signal_failed(num, e.to_string()))
    }

    #[cfg(not(unix))]
    fn signal(&mut self, which: Signal) -> Result<()> {
        let num = match which {
            Signal::Term => 15,
            Signal::Kill => 9,
            Signal::Int => 2,
        };
        self.child
            .kill()
            .map_err(|e| Error::signal_failed(num, e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
    Int,
}

/// Check whether a PID names a live OS process
///
/// Signal 0 probes for existence without delivering anything. EPERM means the
/// process exists but belongs to someone else, which still counts as alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Check whether a PID names a live OS process
#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    pid != 0
}
