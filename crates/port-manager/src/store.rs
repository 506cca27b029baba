//! On-disk assignment store: `<projectDir>/.azure/ports.json`

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// One persisted assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAssignment {
    /// Owning service name
    pub service_name: String,
    /// The assigned host port
    pub port: u16,
    /// True iff the manifest pinned this port
    pub is_explicit: bool,
    /// Last time the assignment was handed out
    pub last_used_at: DateTime<Utc>,
}

/// Serialized shape of `ports.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortsFile {
    /// Assignments keyed by service name
    #[serde(default)]
    pub assignments: HashMap<String, PortAssignment>,
}

/// Store handle for one project's `ports.json`
///
/// All load/save cycles run under an exclusive advisory lock on a sibling
/// `.lock` file, so concurrent `azd app` invocations serialize on the file
/// rather than clobbering each other. Writes are temp + rename.
pub struct PortStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl PortStore {
    /// Create a store handle rooted at a project directory
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        let dir = project_dir.as_ref().join(".azure");
        Self {
            path: dir.join("ports.json"),
            lock_path: dir.join("ports.json.lock"),
        }
    }

    /// Path of the underlying JSON file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the cross-process lock
    pub fn lock(&self) -> Result<StoreLock> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(StoreLock { file })
    }

    /// Load the assignments file; a corrupt file is quarantined once
    pub fn load(&self, _lock: &StoreLock) -> Result<PortsFile> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PortsFile::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<PortsFile>(&content) {
            Ok(file) => Ok(file),
            Err(e) => {
                let quarantine = self.path.with_file_name(format!(
                    "ports.json.corrupt-{}",
                    Utc::now().format("%Y%m%dT%H%M%S")
                ));
                warn!(
                    "ports store at {} is corrupt ({}), quarantining to {}",
                    self.path.display(),
                    e,
                    quarantine.display()
                );
                std::fs::rename(&self.path, &quarantine)?;
                Ok(PortsFile::default())
            }
        }
    }

    /// Persist the assignments atomically (temp + rename)
    pub fn save(&self, _lock: &StoreLock, file: &PortsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(file).map_err(Error::store)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(
            assignments = file.assignments.len(),
            "ports store saved to {}",
            self.path.display()
        );
        Ok(())
    }
}

/// Guard for the cross-process store lock
pub struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs4::fs_std::FileExt::unlock(&self.file);
    }
}
