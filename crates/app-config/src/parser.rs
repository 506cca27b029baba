//! Manifest loading and validation

use std::collections::HashSet;
use std::path::Path;

use tracing::debug;

use crate::{ConfigError, Manifest, Result, ServiceKind};

/// Parse a manifest file and validate it
///
/// Relative `projectDir`/`workdir` values are resolved against the
/// manifest's own directory so the rest of the system only ever sees
/// absolute paths.
pub fn load_file(path: impl AsRef<Path>) -> Result<Manifest> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let mut manifest = load_str(&content)?;

    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let base = base.canonicalize().unwrap_or(base);

    for service in &mut manifest.project.services {
        if service.project_dir.as_os_str().is_empty() {
            service.project_dir = base.clone();
        } else if service.project_dir.is_relative() {
            service.project_dir = base.join(&service.project_dir);
        }
        if let Some(workdir) = &service.workdir {
            if workdir.is_relative() {
                service.workdir = Some(service.project_dir.join(workdir));
            }
        }
    }

    debug!(
        project = %manifest.project.name,
        services = manifest.project.services.len(),
        "loaded manifest from {}",
        path.display()
    );
    Ok(manifest)
}

/// Parse a manifest from a YAML string and validate it
pub fn load_str(content: &str) -> Result<Manifest> {
    let manifest: Manifest = serde_yaml::from_str(content)?;
    validate(&manifest)?;
    Ok(manifest)
}

/// Validate manifest invariants that serde cannot express
pub fn validate(manifest: &Manifest) -> Result<()> {
    let project = &manifest.project;

    if project.name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "project name must not be empty".to_string(),
        ));
    }
    if project.services.is_empty() {
        return Err(ConfigError::Validation(
            "project declares no services".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for service in &project.services {
        if service.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "service name must not be empty".to_string(),
            ));
        }
        if !seen.insert(service.name.as_str()) {
            return Err(ConfigError::DuplicateService(service.name.clone()));
        }
    }

    for service in &project.services {
        for dep in &service.depends_on {
            if project.service(dep).is_none() {
                return Err(ConfigError::UnknownDependency {
                    service: service.name.clone(),
                    dependency: dep.clone(),
                });
            }
            if dep == &service.name {
                return Err(ConfigError::Validation(format!(
                    "service '{}' depends on itself",
                    service.name
                )));
            }
        }

        // Surfaces bad port syntax before anything is started.
        service.port_specs()?;

        if service.kind == ServiceKind::Native
            && service.command.is_empty()
            && service.script.is_none()
        {
            return Err(ConfigError::Validation(format!(
                "native service '{}' needs a command or a script",
                service.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
project:
  name: shop
  services:
    - name: api
      kind: native
      language: python
      framework: fastapi
      command: ["uvicorn", "main:app", "--port", "8080"]
      ports: ["8080"]
    - name: web
      kind: native
      language: js
      command: ["node", "server.js"]
      ports: ["3000"]
      dependsOn: [api]
      env:
        API_URL: http://localhost:8080
    - name: db
      kind: compose
      ports: ["5432"]
  orchestrator:
    failFast: true
    shutdownOrder: reverse
"#;

    #[test]
    fn test_load_valid_manifest() {
        let manifest = load_str(MANIFEST).unwrap();
        let project = &manifest.project;

        assert_eq!(project.name, "shop");
        assert_eq!(project.services.len(), 3);

        let web = project.service("web").unwrap();
        assert_eq!(web.depends_on, vec!["api"]);
        assert_eq!(web.env.get("API_URL").unwrap(), "http://localhost:8080");

        let db = project.service("db").unwrap();
        assert!(db.kind.is_containerized());
        let specs = db.port_specs().unwrap();
        assert_eq!(specs[0].host_port, 0);
        assert_eq!(specs[0].container_port, 5432);

        let orch = project.orchestrator();
        assert!(orch.fail_fast);
        assert_eq!(orch.readiness_deadline, 120);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
project:
  name: p
  services:
    - { name: a, kind: native, command: ["true"] }
    - { name: a, kind: native, command: ["true"] }
"#;
        assert!(matches!(
            load_str(yaml).unwrap_err(),
            ConfigError::DuplicateService(name) if name == "a"
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let yaml = r#"
project:
  name: p
  services:
    - { name: a, kind: native, command: ["true"], dependsOn: [ghost] }
"#;
        assert!(matches!(
            load_str(yaml).unwrap_err(),
            ConfigError::UnknownDependency { dependency, .. } if dependency == "ghost"
        ));
    }

    #[test]
    fn test_invalid_port_spec_rejected() {
        let yaml = r#"
project:
  name: p
  services:
    - { name: a, kind: native, command: ["true"], ports: ["not-a-port"] }
"#;
        assert!(matches!(
            load_str(yaml).unwrap_err(),
            ConfigError::InvalidPortSpec { .. }
        ));
    }

    #[test]
    fn test_native_without_command_rejected() {
        let yaml = r#"
project:
  name: p
  services:
    - { name: a, kind: native }
"#;
        assert!(matches!(
            load_str(yaml).unwrap_err(),
            ConfigError::Validation(_)
        ));
    }

    #[test]
    fn test_paths_resolved_against_manifest_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure.yaml");
        std::fs::write(
            &path,
            r#"
project:
  name: p
  services:
    - name: a
      kind: native
      command: ["true"]
      projectDir: svc-a
      workdir: sub
"#,
        )
        .unwrap();

        let manifest = load_file(&path).unwrap();
        let service = manifest.project.service("a").unwrap();
        assert!(service.project_dir.is_absolute());
        assert!(service.project_dir.ends_with("svc-a"));
        assert!(service.workdir.as_ref().unwrap().ends_with("svc-a/sub"));
    }
}
