//! Per-service log ring buffers with live fan-out
//!
//! Every service keeps one ring buffer per output stream, bounded by line
//! count and byte size. Ingest is synchronous, O(1) amortized and never
//! waits on consumers: the only back-pressure policy is dropping the oldest
//! buffered line, and a subscriber that cannot keep up is sent a one-shot
//! `system` "lagged" event and closed.
//!
//! Within a single service-stream pair, delivery order to every subscriber
//! equals ingest order. There is no ordering guarantee across services.

#![warn(missing_docs)]

mod buffer;
mod mux;

pub use buffer::{RingBuffer, DEFAULT_MAX_BYTES, DEFAULT_MAX_LINES};
pub use mux::{LogFilter, LogMultiplexer, Subscription};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which stream a log line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Child stdout
    Stdout,
    /// Child stderr
    Stderr,
    /// Synthetic events from the orchestrator itself
    System,
}

/// One captured log line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Owning service
    pub service_name: String,
    /// Source stream
    pub stream: LogStream,
    /// Line content, trailing newline stripped
    pub line: String,
    /// Ingest time
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    /// Create an event stamped now, stripping any trailing newline
    pub fn new(service_name: impl Into<String>, stream: LogStream, line: impl Into<String>) -> Self {
        let mut line = line.into();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Self {
            service_name: service_name.into(),
            stream,
            line,
            timestamp: Utc::now(),
        }
    }
}
