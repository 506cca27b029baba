//! Spawning and one-shot execution of child processes

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_io::Timer;
use async_process::{ChildStderr, ChildStdout, Stdio};
use futures::stream::Stream;
use futures_lite::future;
use futures_lite::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::{OutputStream, ProcessEvent, ProcessEventType};
use crate::process::{ExitStatus, ProcessHandle};

/// Default timeout for one-shot commands
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default grace period between SIGTERM and SIGKILL
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Captured result of a one-shot command
#[derive(Debug, Clone)]
pub struct Output {
    /// How the process exited
    pub status: ExitStatus,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl Output {
    /// Returns true if the process exited with code 0
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Turn a non-zero or signaled exit into the matching error
    pub fn into_result(self, program: &str) -> Result<Output> {
        if let Some(signal) = self.status.signal {
            return Err(Error::Signaled {
                program: program.to_string(),
                signal,
            });
        }
        match self.status.code {
            Some(0) => Ok(self),
            Some(code) => Err(Error::Exit {
                program: program.to_string(),
                code,
            }),
            None => Ok(self),
        }
    }
}

/// Callback invoked for every output line of a monitored child
pub type LineMonitor = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// An executor that runs commands on behalf of one named service
pub struct Executor {
    /// The service name for logging/identification
    service_name: String,
}

impl Executor {
    /// Create a new executor for the given service
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Get the service name
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Run a command to completion, capturing its output
    ///
    /// The command is killed and `Error::Timeout` returned when `timeout`
    /// elapses; triggering `cancel` terminates the child (grace, then kill)
    /// and returns `Error::Cancelled`.
    pub async fn run(
        &self,
        cmd: Command,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Output> {
        let program = cmd.program_name();
        debug!(service = %self.service_name, program = %program, "running command");

        let mut async_cmd = cmd.prepare();
        async_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = async_cmd
            .spawn()
            .map_err(|e| map_spawn_error(e, &program))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        enum Outcome {
            Done(std::io::Result<std::process::ExitStatus>, String, String),
            TimedOut,
            Cancelled,
        }

        let outcome = {
            let run = async {
                // Drain both pipes concurrently so neither can fill up and
                // stall the child, then reap it.
                let read_out = async {
                    let mut buf = String::new();
                    if let Some(pipe) = stdout_pipe.as_mut() {
                        let _ = pipe.read_to_string(&mut buf).await;
                    }
                    buf
                };
                let read_err = async {
                    let mut buf = String::new();
                    if let Some(pipe) = stderr_pipe.as_mut() {
                        let _ = pipe.read_to_string(&mut buf).await;
                    }
                    buf
                };
                let (out, err) = future::zip(read_out, read_err).await;
                Outcome::Done(child.status().await, out, err)
            };
            let deadline = async {
                Timer::after(timeout).await;
                Outcome::TimedOut
            };
            let cancelled = async {
                cancel.cancelled().await;
                Outcome::Cancelled
            };
            future::or(run, future::or(deadline, cancelled)).await
        };

        match outcome {
            Outcome::Done(status, stdout, stderr) => {
                let status = status
                    .map_err(|e| Error::spawn_failed(format!("failed to wait for process: {}", e)))?;
                Ok(Output {
                    status: ExitStatus::from_std(status),
                    stdout,
                    stderr,
                })
            }
            Outcome::TimedOut => {
                let mut handle = ProcessHandle::new(child, program.clone());
                let _ = handle.kill().await;
                Err(Error::Timeout {
                    program,
                    timeout_secs: timeout.as_secs(),
                })
            }
            Outcome::Cancelled => {
                let mut handle = ProcessHandle::new(child, program.clone());
                let _ = handle.terminate(DEFAULT_STOP_GRACE).await;
                Err(Error::Cancelled { program })
            }
        }
    }

    /// Start a long-running child, returning its event stream and handle
    pub fn spawn(&self, cmd: Command) -> Result<(ProcessEventStream, ProcessHandle)> {
        self.spawn_inner(cmd, None)
    }

    /// Start a long-running child, mirroring every output line to `monitor`
    ///
    /// The callback fires as the stream is polled, so supervisors can watch
    /// for ready markers without consuming the events themselves.
    pub fn spawn_monitored(
        &self,
        cmd: Command,
        monitor: LineMonitor,
    ) -> Result<(ProcessEventStream, ProcessHandle)> {
        self.spawn_inner(cmd, Some(monitor))
    }

    fn spawn_inner(
        &self,
        cmd: Command,
        monitor: Option<LineMonitor>,
    ) -> Result<(ProcessEventStream, ProcessHandle)> {
        let program = cmd.program_name();
        debug!(service = %self.service_name, program = %program, "spawning child");

        let mut async_cmd = cmd.prepare();
        async_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = async_cmd
            .spawn()
            .map_err(|e| map_spawn_error(e, &program))?;

        let child_id = child.id();
        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        let events = ProcessEventStream {
            stdout,
            stderr,
            started_sent: false,
            child_id,
            monitor,
        };
        let handle = ProcessHandle::new(child, program);

        Ok((events, handle))
    }
}

fn map_spawn_error(err: std::io::Error, program: &str) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound {
            program: program.to_string(),
        }
    } else {
        Error::spawn_failed(format!("failed to spawn '{}': {}", program, err))
    }
}

/// Stream of process events for one spawned child
///
/// Yields `Started` once, then one `Stdout`/`Stderr` event per line until
/// both pipes reach EOF.
pub struct ProcessEventStream {
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
    started_sent: bool,
    child_id: u32,
    monitor: Option<LineMonitor>,
}

impl Stream for ProcessEventStream {
    type Item = ProcessEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.started_sent {
            self.started_sent = true;
            let event = ProcessEvent::new(ProcessEventType::Started { pid: self.child_id });
            return Poll::Ready(Some(event));
        }

        if let Some(stdout) = &mut self.stdout {
            match Pin::new(stdout).poll_next(cx) {
                Poll::Ready(Some(Ok(line))) => {
                    if let Some(monitor) = &self.monitor {
                        monitor(OutputStream::Stdout, &line);
                    }
                    let event = ProcessEvent::with_line(ProcessEventType::Stdout, line);
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                    self.stdout = None;
                }
                Poll::Pending => {}
            }
        }

        if let Some(stderr) = &mut self.stderr {
            match Pin::new(stderr).poll_next(cx) {
                Poll::Ready(Some(Ok(line))) => {
                    if let Some(monitor) = &self.monitor {
                        monitor(OutputStream::Stderr, &line);
                    }
                    let event = ProcessEvent::with_line(ProcessEventType::Stderr, line);
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                    self.stderr = None;
                }
                Poll::Pending => {}
            }
        }

        if self.stdout.is_none() && self.stderr.is_none() {
            return Poll::Ready(None);
        }

        Poll::Pending
    }
}
