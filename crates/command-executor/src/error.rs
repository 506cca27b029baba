//! Error types for command execution

use thiserror::Error;

/// Unified error type for command execution
#[derive(Error, Debug)]
pub enum Error {
    /// Executable not present on PATH
    #[error("executable not found: {program}")]
    NotFound {
        /// The program that could not be resolved
        program: String,
    },

    /// An argument, script name or working directory failed validation
    #[error("invalid argument: {reason}")]
    InvalidArg {
        /// Why validation rejected the input
        reason: String,
    },

    /// Command did not finish within its timeout
    #[error("command '{program}' timed out after {timeout_secs}s")]
    Timeout {
        /// The program that was killed
        program: String,
        /// The timeout that elapsed, in seconds
        timeout_secs: u64,
    },

    /// Process exited with a non-zero code
    #[error("command '{program}' exited with code {code}")]
    Exit {
        /// The program that failed
        program: String,
        /// The non-zero exit code
        code: i32,
    },

    /// Process was terminated by a signal
    #[error("command '{program}' terminated by signal {signal}")]
    Signaled {
        /// The program that was killed
        program: String,
        /// The signal number
        signal: i32,
    },

    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Failed to send a signal to a process
    #[error("failed to send signal {signal}: {reason}")]
    SignalFailed {
        /// The signal number that failed to send
        signal: i32,
        /// The reason for the signal failure
        reason: String,
    },

    /// Execution was cancelled before completion
    #[error("command '{program}' cancelled")]
    Cancelled {
        /// The program that was interrupted
        program: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Nix error (Unix signal handling)
    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create a validation error
    pub fn invalid_arg(reason: impl Into<String>) -> Self {
        Self::InvalidArg {
            reason: reason.into(),
        }
    }

    /// Create a signal failed error
    pub fn signal_failed(signal: i32, reason: impl Into<String>) -> Self {
        Self::SignalFailed {
            signal,
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
