//! Child process execution for the azd-app orchestrator
//!
//! This crate provides the single place where OS processes are created:
//! one-shot commands with captured output and a timeout, and long-running
//! service children with line-level output streaming and graceful
//! termination. Arguments are always passed positionally; nothing in this
//! crate goes through a shell.

#![warn(missing_docs)]

pub mod cancel;
pub mod command;
pub mod error;
pub mod event;
pub mod executor;
pub mod process;
pub mod validate;

pub use cancel::CancelToken;
pub use command::Command;
pub use error::{Error, Result};
pub use event::{OutputStream, ProcessEvent, ProcessEventType};
pub use executor::{Executor, Output, DEFAULT_RUN_TIMEOUT, DEFAULT_STOP_GRACE};
pub use process::{ExitStatus, ProcessHandle};
pub use validate::{validate_executable, validate_workdir};
