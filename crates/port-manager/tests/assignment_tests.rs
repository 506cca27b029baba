//! Assignment behavior across manager instances sharing one project dir

use std::net::TcpListener;

use port_manager::{PortManager, DASHBOARD_SERVICE};

#[test]
fn test_assignments_survive_across_instances() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();

        let (web_port, _) = PortManager::new(dir.path())
            .assign("web", 0, false, true)
            .await
            .unwrap();
        let (api_port, _) = PortManager::new(dir.path())
            .assign("api", 0, false, true)
            .await
            .unwrap();
        assert_ne!(web_port, api_port);

        // A third instance, as a later invocation would create, sees both.
        let manager = PortManager::new(dir.path());
        let file = manager.load_assignments().await.unwrap();
        assert_eq!(file.assignments.len(), 2);
        assert_eq!(file.assignments["web"].port, web_port);
        assert_eq!(file.assignments["api"].port, api_port);

        // And reuses the recorded ports.
        let (again, _) = manager.assign("web", 0, false, true).await.unwrap();
        assert_eq!(again, web_port);
    });
}

#[test]
fn test_conflicting_instances_never_share_a_port() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();

        // Both managers want 41000; only one can have it.
        let first = PortManager::new(dir.path());
        let second = PortManager::new(dir.path());

        let (a, _) = first.assign("one", 41000, false, true).await.unwrap();
        let (b, _) = second.assign("two", 41000, false, true).await.unwrap();
        assert_ne!(a, b);
    });
}

#[test]
fn test_dashboard_assignment_is_recorded_and_releasable() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let manager = PortManager::new(dir.path());

        let port = manager.assign_dashboard(None).await.unwrap();
        assert!(port >= 1024);

        let file = manager.load_assignments().await.unwrap();
        let recorded = &file.assignments[DASHBOARD_SERVICE];
        assert_eq!(recorded.port, port);
        assert!(!recorded.is_explicit, "the dashboard port is never pinned");

        manager.release(DASHBOARD_SERVICE).await.unwrap();
        let file = manager.load_assignments().await.unwrap();
        assert!(!file.assignments.contains_key(DASHBOARD_SERVICE));
    });
}

#[test]
fn test_occupied_preferred_port_reported_with_detail() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let manager = PortManager::new(dir.path());

        let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = blocker.local_addr().unwrap().port();

        let err = manager.assign("svc", busy, true, false).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains(&busy.to_string()));
        assert!(message.contains("svc"));
        drop(blocker);
    });
}
