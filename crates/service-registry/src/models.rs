//! Data models for the service registry

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Child spawned, not yet ready
    Starting,
    /// Readiness achieved (healthy probe or ready marker)
    Ready,
    /// Shutdown in progress
    Stopping,
    /// Child has exited
    Stopped,
    /// Startup or supervision failed
    Error,
}

/// Health classification of a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Probes pass
    Healthy,
    /// Probes degraded or still within the start period
    Degraded,
    /// Probes failing
    Unhealthy,
    /// No probe method applies yet
    Unknown,
}

/// A registered service entry
///
/// Keyed by `(project_dir, name)`. The invariants `url.is_some() == (port >
/// 0)` and `status == Stopped => pid == 0` are maintained by the
/// constructors and [`crate::Registry`] update paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    /// Absolute project directory
    pub project_dir: PathBuf,
    /// Service name, unique within the project
    pub name: String,
    /// OS process id; 0 when stopped
    pub pid: u32,
    /// Primary host port; 0 when none
    pub port: u16,
    /// Base URL derived from the port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Free-form language tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Free-form framework tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    /// Lifecycle status
    pub status: ServiceStatus,
    /// Health classification
    pub health: HealthState,
    /// When the service started
    pub started_at: DateTime<Utc>,
    /// When the entry was last touched by its supervisor or a health round
    pub last_checked_at: DateTime<Utc>,
    /// Most recent error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ServiceEntry {
    /// Create a new entry in the `Starting` state
    pub fn new(project_dir: impl Into<PathBuf>, name: impl Into<String>, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            project_dir: project_dir.into(),
            name: name.into(),
            pid,
            port: 0,
            url: None,
            language: None,
            framework: None,
            status: ServiceStatus::Starting,
            health: HealthState::Unknown,
            started_at: now,
            last_checked_at: now,
            last_error: None,
        }
    }

    /// Set the primary port, deriving the URL
    pub fn with_port(mut self, port: u16) -> Self {
        self.set_port(port);
        self
    }

    /// Set the language tag
    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    /// Set the framework tag
    pub fn with_framework(mut self, framework: Option<String>) -> Self {
        self.framework = framework;
        self
    }

    /// Update the primary port, keeping the URL consistent
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
        self.url = if port > 0 {
            Some(format!("http://localhost:{}", port))
        } else {
            None
        };
    }

    /// The registry key for this entry
    pub fn key(&self) -> String {
        entry_key(&self.project_dir, &self.name)
    }
}

/// Compose the registry key for a `(project_dir, name)` pair
pub fn entry_key(project_dir: &Path, name: &str) -> String {
    format!("{}:{}", project_dir.display(), name)
}

/// In-memory change notifications consumed by the dashboard mirror
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// An entry was added or replaced
    Upserted {
        /// The new entry value
        entry: ServiceEntry,
    },
    /// An entry was removed
    Removed {
        /// Project directory component of the key
        project_dir: PathBuf,
        /// Service name component of the key
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_follows_port() {
        let mut entry = ServiceEntry::new("/proj", "web", 42);
        assert!(entry.url.is_none());

        entry.set_port(3000);
        assert_eq!(entry.url.as_deref(), Some("http://localhost:3000"));

        entry.set_port(0);
        assert!(entry.url.is_none());
    }

    #[test]
    fn test_entry_key() {
        let entry = ServiceEntry::new("/proj", "web", 1);
        assert_eq!(entry.key(), "/proj:web");
    }

    #[test]
    fn test_wire_shape() {
        let entry = ServiceEntry::new("/proj", "web", 7).with_port(3000);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["projectDir"], "/proj");
        assert_eq!(json["status"], "starting");
        assert_eq!(json["health"], "unknown");
        assert_eq!(json["url"], "http://localhost:3000");
        assert!(json["startedAt"].is_string());
    }
}
