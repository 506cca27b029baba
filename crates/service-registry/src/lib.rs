//! Cross-process service registry
//!
//! An on-disk index of currently running services, shared between every
//! `azd app` invocation on the machine and mirrored live by the project
//! dashboard. The store is a flat JSON file under `~/.azd/app/`; writers
//! take an exclusive advisory lock, readers a shared one, and entries whose
//! PID no longer names a live process are pruned on read.

#![warn(missing_docs)]

pub mod models;
pub mod registry;
pub mod store;

pub use models::{HealthState, RegistryEvent, ServiceEntry, ServiceStatus};
pub use registry::Registry;
pub use store::RegistryStore;

use thiserror::Error;

/// Error types for registry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Service not found
    #[error("service '{name}' not registered for project {project_dir}")]
    ServiceNotFound {
        /// Project directory component of the key
        project_dir: String,
        /// Service name component of the key
        name: String,
    },

    /// The store could not be serialized or deserialized
    #[error("registry store error: {0}")]
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
