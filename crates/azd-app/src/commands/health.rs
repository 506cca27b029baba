//! `azd-app health`: probe services and report

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use app_config::HealthCheckSpec;
use health_checker::{CheckerConfig, HealthChecker};
use service_registry::HealthState;

use crate::{context, EXIT_CONFIG, EXIT_UNHEALTHY};

#[allow(clippy::too_many_arguments)]
pub async fn run(
    project: &Path,
    service: Option<String>,
    stream: bool,
    interval: u64,
    timeout: u64,
    endpoint: Option<String>,
) -> Result<u8> {
    let project_dir = context::project_dir(project)?;
    let ctx = context::run_context(&project_dir);

    // Declared health checks come from the manifest when present; the
    // command also works against a bare registry.
    let manifest_path = context::manifest_path(&project_dir);
    let declared: std::collections::HashMap<String, HealthCheckSpec> = match manifest_path.exists()
    {
        true => match app_config::load_file(&manifest_path) {
            Ok(manifest) => manifest
                .project
                .services
                .into_iter()
                .filter_map(|s| s.health_check.map(|h| (s.name, h)))
                .collect(),
            Err(e) => {
                eprintln!("error: {}", e);
                return Ok(EXIT_CONFIG);
            }
        },
        false => Default::default(),
    };

    let checker = HealthChecker::with_config(CheckerConfig {
        probe_timeout: Duration::from_secs(timeout),
        ..Default::default()
    });

    loop {
        let entries = ctx.registry.list_by_project(&project_dir).await?;
        let services: Vec<_> = entries
            .into_iter()
            .filter(|e| service.as_ref().map(|s| &e.name == s).unwrap_or(true))
            .map(|entry| {
                let mut spec = declared.get(&entry.name).cloned();
                if let Some(endpoint) = &endpoint {
                    let with_endpoint = HealthCheckSpec {
                        endpoint: Some(endpoint.clone()),
                        ..spec.clone().unwrap_or_default()
                    };
                    spec = Some(with_endpoint);
                }
                (entry, spec)
            })
            .collect();

        let report = checker.report(&project_dir.display().to_string(), &services).await;
        println!("{}", serde_json::to_string_pretty(&report)?);

        if !stream {
            return Ok(if report.summary.overall == HealthState::Healthy {
                0
            } else {
                EXIT_UNHEALTHY
            });
        }
        smol::Timer::after(Duration::from_secs(interval.max(1))).await;
    }
}
