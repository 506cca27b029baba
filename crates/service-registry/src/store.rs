//! Flat-file JSON store under `~/.azd/app/services.json`

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs4::fs_std::FileExt;
use tracing::{debug, warn};

use crate::models::ServiceEntry;
use crate::{Error, Result};

/// Serialized shape: registry key → entry
pub type StoreMap = HashMap<String, ServiceEntry>;

/// Handle to the shared on-disk store
///
/// Readers take a shared advisory lock, writers an exclusive one, both on a
/// sibling `.lock` file so the JSON file itself can be atomically replaced
/// by rename. A store that fails to parse is quarantined once and replaced
/// with a fresh one.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl RegistryStore {
    /// Store at the default location, `~/.azd/app/services.json`
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".azd")
            .join("app");
        Self::at(base.join("services.json"))
    }

    /// Store at an explicit path (used by tests and scoped setups)
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("json.lock");
        Self { path, lock_path }
    }

    /// Path of the underlying JSON file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full map under a shared lock
    pub fn read(&self) -> Result<StoreMap> {
        let _lock = self.acquire(false)?;
        self.load_unlocked()
    }

    /// Run a read-modify-write cycle under the exclusive lock
    pub fn update<F, T>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut StoreMap) -> T,
    {
        let _lock = self.acquire(true)?;
        let mut map = self.load_unlocked()?;
        let out = mutate(&mut map);
        self.save_unlocked(&map)?;
        Ok(out)
    }

    fn acquire(&self, exclusive: bool) -> Result<std::fs::File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            FileExt::lock_shared(&file)?;
        }
        Ok(file)
    }

    fn load_unlocked(&self) -> Result<StoreMap> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(map) => Ok(map),
            Err(e) => {
                let quarantine = self.path.with_file_name(format!(
                    "services.json.corrupt-{}",
                    Utc::now().format("%Y%m%dT%H%M%S")
                ));
                warn!(
                    "registry store at {} is corrupt ({}), quarantining to {}",
                    self.path.display(),
                    e,
                    quarantine.display()
                );
                std::fs::rename(&self.path, &quarantine)?;
                Ok(StoreMap::new())
            }
        }
    }

    fn save_unlocked(&self, map: &StoreMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(map).map_err(Error::store)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(entries = map.len(), "registry store saved");
        Ok(())
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::at(dir.path().join("services.json"));

        let entry = ServiceEntry::new("/proj", "web", 1).with_port(3000);
        store
            .update(|map| {
                map.insert(entry.key(), entry.clone());
            })
            .unwrap();

        let loaded = store.read().unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded["/proj:web"];
        assert_eq!(got.name, "web");
        assert_eq!(got.port, 3000);
        assert_eq!(got.url, entry.url);
    }

    #[test]
    fn test_corrupt_store_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::at(dir.path().join("services.json"));
        std::fs::write(store.path(), "][").unwrap();

        assert!(store.read().unwrap().is_empty());
        let quarantined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("services.json.corrupt-")
            });
        assert!(quarantined);
    }
}
