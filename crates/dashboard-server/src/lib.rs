//! Embedded per-project dashboard server
//!
//! One instance per `azd app` run, keyed by absolute project directory and
//! listening on the reserved `azd-app-dashboard` port assignment. Serves
//! JSON snapshots of the registry and health state over plain HTTP and
//! streams live updates over a WebSocket push channel with per-subscriber
//! rate limiting.

#![warn(missing_docs)]

mod assets;
mod http;
mod push;
mod server;

pub use push::Envelope;
pub use server::{Dashboard, DashboardHandle};

use thiserror::Error;

/// Dashboard server errors
#[derive(Debug, Error)]
pub enum Error {
    /// Could not bind the dashboard listener
    #[error("failed to bind dashboard port {port}: {reason}")]
    Bind {
        /// The port that could not be bound
        port: u16,
        /// Cause
        reason: String,
    },

    /// Registry access failed
    #[error("registry error: {0}")]
    Registry(#[from] service_registry::Error),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
