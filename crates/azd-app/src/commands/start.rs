//! `azd-app start`: bring the project up and keep it supervised

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use dashboard_server::Dashboard;
use service_orchestration::{Error as OrchestrationError, Orchestrator};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::debug;

use crate::{context, EXIT_CONFIG, EXIT_INTERRUPTED, EXIT_UNHEALTHY};

pub async fn run(project: &Path, services: Vec<String>, fail_fast: bool) -> Result<u8> {
    let project_dir = context::project_dir(project)?;
    let manifest_path = context::manifest_path(&project_dir);

    let manifest = match app_config::load_file(&manifest_path) {
        Ok(manifest) => manifest,
        Err(e) => {
            eprintln!("error: {}", e);
            return Ok(EXIT_CONFIG);
        }
    };
    let mut project_model = manifest.project;
    if fail_fast {
        let mut orchestration = project_model.orchestrator();
        orchestration.fail_fast = true;
        project_model.orchestrator = Some(orchestration);
    }

    let ctx = context::run_context(&project_dir);

    // Ctrl-C cancels the run; the orchestrator drives everything to
    // `stopped` from there.
    let cancel = ctx.cancel.clone();
    let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGTERM])
        .context("failed to install signal handler")?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            eprintln!("\ninterrupt received, shutting down...");
            cancel.cancel();
        }
    });

    // The dashboard is just another port assignment, reserved and flexible.
    let dashboard_port = ctx
        .ports
        .assign_dashboard(project_model.dashboard.as_ref().and_then(|d| d.port))
        .await?;
    let health_specs: HashMap<_, _> = project_model
        .services
        .iter()
        .filter_map(|s| s.health_check.clone().map(|h| (s.name.clone(), h)))
        .collect();
    let dashboard = Dashboard::new(
        project_model.name.clone(),
        &project_dir,
        ctx.registry.clone(),
        ctx.health.clone(),
        ctx.logs.clone(),
    )
    .with_health_specs(health_specs)
    .serve(dashboard_port)
    .await?;
    println!("Dashboard: {}", dashboard.url());

    let mut orchestrator =
        Orchestrator::new(project_model, ctx.clone()).with_manifest_path(&manifest_path);

    let filter = if services.is_empty() {
        None
    } else {
        Some(services.as_slice())
    };
    let outcome = match orchestrator.start(filter).await {
        Ok(outcome) => outcome,
        Err(e) => {
            dashboard.stop().await;
            let _ = ctx.ports.release(port_manager::DASHBOARD_SERVICE).await;
            return Ok(report_error(e));
        }
    };

    for name in &outcome.ready {
        println!("  {} ready", name);
    }
    for (name, reason) in &outcome.failed {
        eprintln!("  {} failed: {}", name, reason);
        eprintln!("    next: azd-app logs --service {}", name);
    }

    if outcome.interrupted {
        orchestrator.shutdown().await?;
        dashboard.stop().await;
        let _ = ctx.ports.release(port_manager::DASHBOARD_SERVICE).await;
        return Ok(EXIT_INTERRUPTED);
    }
    if !outcome.failed.is_empty() && outcome.ready.is_empty() {
        // Nothing survived; no point staying resident.
        orchestrator.shutdown().await?;
        dashboard.stop().await;
        let _ = ctx.ports.release(port_manager::DASHBOARD_SERVICE).await;
        return Ok(EXIT_UNHEALTHY);
    }

    println!(
        "{} service(s) running; press Ctrl-C to stop",
        outcome.ready.len()
    );

    // Stay resident supervising the children until the user interrupts.
    ctx.cancel.cancelled().await;
    debug!("run cancelled, shutting down");
    orchestrator.shutdown().await?;
    dashboard.stop().await;
    let _ = ctx.ports.release(port_manager::DASHBOARD_SERVICE).await;

    if !outcome.failed.is_empty() {
        return Ok(EXIT_UNHEALTHY);
    }
    Ok(EXIT_INTERRUPTED)
}

fn report_error(error: OrchestrationError) -> u8 {
    match &error {
        OrchestrationError::DependencyCycle(_)
        | OrchestrationError::Config(_)
        | OrchestrationError::ServiceNotFound(_)
        | OrchestrationError::Manifest(_) => {
            eprintln!("error: {}", error);
            EXIT_CONFIG
        }
        OrchestrationError::Ports(e) => {
            eprintln!("error: {}", e);
            eprintln!("  next: stop the occupant or mark the service flexible");
            EXIT_UNHEALTHY
        }
        _ => {
            eprintln!("error: {}", error);
            EXIT_UNHEALTHY
        }
    }
}
