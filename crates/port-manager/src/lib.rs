//! Persistent port assignment for azd-app projects
//!
//! Answers "what port should service S of project P use?" with stable,
//! conflict-free values. Assignments live in `<projectDir>/.azure/ports.json`
//! and survive across runs; within a process, assignment is serialized by a
//! project-scoped mutex, and across processes by an advisory file lock.

#![warn(missing_docs)]

mod manager;
mod store;

pub use manager::{LivenessProbe, PortManager, DASHBOARD_PORT, DASHBOARD_SERVICE};
pub use store::{PortAssignment, PortStore, PortsFile};

use thiserror::Error;

/// Errors produced by port assignment
#[derive(Debug, Error)]
pub enum Error {
    /// A pinned port is occupied and the service is not flexible
    #[error("port {port} requested by '{service}' is already in use (occupant pid {occupant_pid:?})")]
    PortInUse {
        /// Service that requested the port
        service: String,
        /// The occupied port
        port: u16,
        /// PID of the occupant, when discoverable
        occupant_pid: Option<u32>,
    },

    /// No free port remained in the scan range
    #[error("no free port available for '{service}' starting from {start}")]
    Exhausted {
        /// Service that requested a port
        service: String,
        /// First port that was probed
        start: u16,
    },

    /// The assignments store could not be read or written
    #[error("ports store error: {0}")]
    Store(String),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
