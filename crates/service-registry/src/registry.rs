//! Core service registry implementation

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use command_executor::process::pid_alive;
use futures::lock::Mutex;
use tracing::{debug, info};

use crate::models::{entry_key, HealthState, RegistryEvent, ServiceEntry, ServiceStatus};
use crate::store::RegistryStore;
use crate::{Error, Result};

/// How long a dead-PID entry may linger before prune-on-read removes it
const DEFAULT_STALENESS_SECS: i64 = 60;

/// Service registry handle
///
/// Writes for one `(project_dir, name)` key are serialized by a per-key
/// mutex so external observers see a total order per key; there is no
/// global order across keys. Every mutation is broadcast to in-memory
/// subscribers (the dashboard mirror).
pub struct Registry {
    store: RegistryStore,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    subscribers: Mutex<Vec<async_channel::Sender<RegistryEvent>>>,
    staleness: ChronoDuration,
}

impl Registry {
    /// Registry over the default store location
    pub fn new() -> Self {
        Self::with_store(RegistryStore::new())
    }

    /// Registry over an explicit store
    pub fn with_store(store: RegistryStore) -> Self {
        Self {
            store,
            key_locks: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            staleness: ChronoDuration::seconds(DEFAULT_STALENESS_SECS),
        }
    }

    /// Override the staleness window (tests)
    pub fn with_staleness(mut self, staleness: ChronoDuration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Subscribe to registry change events
    pub async fn subscribe(&self) -> async_channel::Receiver<RegistryEvent> {
        let (tx, rx) = async_channel::bounded(256);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Add or replace an entry
    pub async fn register(&self, entry: ServiceEntry) -> Result<()> {
        let key = entry.key();
        let _guard = self.key_lock(&key).await;

        info!(service = %entry.name, pid = entry.pid, port = entry.port, "registering service");
        self.store.update(|map| {
            map.insert(key, entry.clone());
        })?;
        self.emit(RegistryEvent::Upserted { entry }).await;
        Ok(())
    }

    /// Remove an entry; succeeds even when it does not exist
    pub async fn unregister(&self, project_dir: &Path, name: &str) -> Result<()> {
        let key = entry_key(project_dir, name);
        let _guard = self.key_lock(&key).await;

        let removed = self.store.update(|map| map.remove(&key).is_some())?;
        if removed {
            debug!(service = name, "unregistered service");
            self.emit(RegistryEvent::Removed {
                project_dir: project_dir.to_path_buf(),
                name: name.to_string(),
            })
            .await;
        }
        Ok(())
    }

    /// Update status, health and error of an entry
    pub async fn update_status(
        &self,
        project_dir: &Path,
        name: &str,
        status: ServiceStatus,
        health: HealthState,
        error: Option<String>,
    ) -> Result<()> {
        let key = entry_key(project_dir, name);
        let _guard = self.key_lock(&key).await;

        let updated = self.store.update(|map| {
            let entry = map.get_mut(&key)?;
            entry.status = status;
            entry.health = health;
            entry.last_error = error;
            entry.last_checked_at = Utc::now();
            if status == ServiceStatus::Stopped {
                entry.pid = 0;
            }
            Some(entry.clone())
        })?;

        match updated {
            Some(entry) => {
                debug!(service = name, status = ?status, health = ?health, "status updated");
                self.emit(RegistryEvent::Upserted { entry }).await;
                Ok(())
            }
            None => Err(Error::ServiceNotFound {
                project_dir: project_dir.display().to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// Refresh health fields after a probe round
    pub async fn update_health(
        &self,
        project_dir: &Path,
        name: &str,
        health: HealthState,
        error: Option<String>,
    ) -> Result<()> {
        let key = entry_key(project_dir, name);
        let _guard = self.key_lock(&key).await;

        let updated = self.store.update(|map| {
            let entry = map.get_mut(&key)?;
            entry.health = health;
            entry.last_error = error;
            entry.last_checked_at = Utc::now();
            Some(entry.clone())
        })?;

        if let Some(entry) = updated {
            self.emit(RegistryEvent::Upserted { entry }).await;
        }
        Ok(())
    }

    /// Get one entry
    pub async fn get_service(&self, project_dir: &Path, name: &str) -> Result<Option<ServiceEntry>> {
        let map = self.read_pruned()?;
        Ok(map.get(&entry_key(project_dir, name)).cloned())
    }

    /// Every live entry in the store
    pub async fn list_all(&self) -> Result<Vec<ServiceEntry>> {
        let map = self.read_pruned()?;
        let mut entries: Vec<_> = map.into_values().collect();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(entries)
    }

    /// Entries belonging to one project
    pub async fn list_by_project(&self, project_dir: &Path) -> Result<Vec<ServiceEntry>> {
        let mut entries = self.list_all().await?;
        entries.retain(|e| e.project_dir == project_dir);
        Ok(entries)
    }

    /// Remove every entry
    pub async fn clear(&self) -> Result<()> {
        self.store.update(|map| map.clear())?;
        Ok(())
    }

    /// Read the store, dropping stale dead-PID entries
    ///
    /// Pruning is best-effort: the filtered view is returned even when the
    /// cleanup write fails.
    fn read_pruned(&self) -> Result<HashMap<String, ServiceEntry>> {
        let mut map = self.store.read()?;
        let cutoff = Utc::now() - self.staleness;

        let stale: Vec<String> = map
            .iter()
            .filter(|(_, e)| !pid_alive(e.pid) && e.last_checked_at < cutoff)
            .map(|(k, _)| k.clone())
            .collect();

        if !stale.is_empty() {
            debug!(count = stale.len(), "pruning stale registry entries");
            for key in &stale {
                map.remove(key);
            }
            let keys = stale;
            let _ = self.store.update(move |persisted| {
                for key in &keys {
                    persisted.remove(key);
                }
            });
        }

        Ok(map)
    }

    async fn key_lock(&self, key: &str) -> futures::lock::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn emit(&self, event: RegistryEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| {
            // Slow or departed mirrors are dropped, never waited on.
            !matches!(
                tx.try_send(event.clone()),
                Err(async_channel::TrySendError::Closed(_))
            )
        });
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry(dir: &Path) -> Registry {
        Registry::with_store(RegistryStore::at(dir.join("services.json")))
    }

    #[smol_potat::test]
    async fn test_register_get_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());

        let entry = ServiceEntry::new("/proj", "web", std::process::id()).with_port(3000);
        registry.register(entry.clone()).await.unwrap();

        let got = registry
            .get_service(Path::new("/proj"), "web")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.port, 3000);
        assert_eq!(got.url.as_deref(), Some("http://localhost:3000"));

        registry
            .unregister(Path::new("/proj"), "web")
            .await
            .unwrap();
        assert!(registry
            .get_service(Path::new("/proj"), "web")
            .await
            .unwrap()
            .is_none());
    }

    #[smol_potat::test]
    async fn test_unregister_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        registry
            .unregister(Path::new("/proj"), "ghost")
            .await
            .unwrap();
    }

    #[smol_potat::test]
    async fn test_one_entry_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());

        let pid = std::process::id();
        registry
            .register(ServiceEntry::new("/proj", "web", pid).with_port(3000))
            .await
            .unwrap();
        registry
            .register(ServiceEntry::new("/proj", "web", pid).with_port(3001))
            .await
            .unwrap();

        let all = registry.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].port, 3001);
    }

    #[smol_potat::test]
    async fn test_update_status_stopped_clears_pid() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());

        registry
            .register(ServiceEntry::new("/proj", "web", std::process::id()))
            .await
            .unwrap();
        registry
            .update_status(
                Path::new("/proj"),
                "web",
                ServiceStatus::Stopped,
                HealthState::Unknown,
                None,
            )
            .await
            .unwrap();

        let got = registry
            .get_service(Path::new("/proj"), "web")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.status, ServiceStatus::Stopped);
        assert_eq!(got.pid, 0);
    }

    #[smol_potat::test]
    async fn test_update_status_unknown_service_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());

        let err = registry
            .update_status(
                Path::new("/proj"),
                "ghost",
                ServiceStatus::Ready,
                HealthState::Healthy,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound { .. }));
    }

    #[smol_potat::test]
    async fn test_stale_dead_pid_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).with_staleness(ChronoDuration::zero());

        // Far above any real pid_max, so never a live process.
        let mut dead = ServiceEntry::new("/proj", "dead", 999_999_999);
        dead.last_checked_at = Utc::now() - ChronoDuration::seconds(5);
        registry.register(dead).await.unwrap();

        let live = ServiceEntry::new("/proj", "live", std::process::id());
        registry.register(live).await.unwrap();

        let all = registry.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "live");
        assert!(registry
            .get_service(Path::new("/proj"), "dead")
            .await
            .unwrap()
            .is_none());
    }

    #[smol_potat::test]
    async fn test_list_by_project_filters() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());

        let pid = std::process::id();
        registry
            .register(ServiceEntry::new("/proj-a", "web", pid))
            .await
            .unwrap();
        registry
            .register(ServiceEntry::new("/proj-b", "web", pid))
            .await
            .unwrap();

        let a = registry.list_by_project(Path::new("/proj-a")).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].project_dir, Path::new("/proj-a"));
    }

    #[smol_potat::test]
    async fn test_events_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let events = registry.subscribe().await;

        registry
            .register(ServiceEntry::new("/proj", "web", std::process::id()))
            .await
            .unwrap();
        registry
            .unregister(Path::new("/proj"), "web")
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Upserted { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Removed { .. }
        ));
    }
}
