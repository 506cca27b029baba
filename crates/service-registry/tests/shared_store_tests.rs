//! Cross-handle registry behavior over one shared store
//!
//! Two `Registry` handles over the same file stand in for two concurrent
//! `azd app` invocations.

use std::path::Path;
use std::sync::Arc;

use service_registry::{HealthState, Registry, RegistryStore, ServiceEntry, ServiceStatus};

fn two_handles(dir: &Path) -> (Registry, Registry) {
    let store = RegistryStore::at(dir.join("services.json"));
    (
        Registry::with_store(store.clone()),
        Registry::with_store(store),
    )
}

#[test]
fn test_second_handle_sees_first_handles_writes() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = two_handles(dir.path());

        let entry = ServiceEntry::new("/proj", "web", std::process::id()).with_port(3000);
        writer.register(entry).await.unwrap();

        let seen = reader
            .get_service(Path::new("/proj"), "web")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.port, 3000);
        assert_eq!(seen.status, ServiceStatus::Starting);

        writer
            .update_status(
                Path::new("/proj"),
                "web",
                ServiceStatus::Ready,
                HealthState::Healthy,
                None,
            )
            .await
            .unwrap();

        let seen = reader
            .get_service(Path::new("/proj"), "web")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.status, ServiceStatus::Ready);
        assert_eq!(seen.health, HealthState::Healthy);
    });
}

#[test]
fn test_concurrent_writers_keep_one_entry_per_key() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::at(dir.path().join("services.json"));
        let registry = Arc::new(Registry::with_store(store));

        // Many interleaved writers per key; each key must end up with
        // exactly one entry, the last port written by one of its writers.
        let mut tasks = Vec::new();
        for i in 0..10u16 {
            for attempt in 0..5u16 {
                let registry = registry.clone();
                tasks.push(smol::spawn(async move {
                    let entry = ServiceEntry::new("/proj", format!("svc-{}", i), std::process::id())
                        .with_port(1000 + attempt);
                    registry.register(entry).await.unwrap();
                }));
            }
        }
        for task in tasks {
            task.await;
        }

        let all = registry.list_all().await.unwrap();
        assert_eq!(all.len(), 10);
        for entry in all {
            assert!((1000..1005).contains(&entry.port));
        }
    });
}

#[test]
fn test_status_updates_serialized_per_key() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::at(dir.path().join("services.json"));
        let registry = Arc::new(Registry::with_store(store));

        registry
            .register(ServiceEntry::new("/proj", "web", std::process::id()))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let registry = registry.clone();
            tasks.push(smol::spawn(async move {
                registry
                    .update_status(
                        Path::new("/proj"),
                        "web",
                        ServiceStatus::Ready,
                        HealthState::Healthy,
                        None,
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await;
        }

        // All writers completed and the entry is intact.
        let entry = registry
            .get_service(Path::new("/proj"), "web")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, ServiceStatus::Ready);
    });
}
