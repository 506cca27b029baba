//! `azd-app stop`: stop registered services from any process

use std::path::Path;

use anyhow::Result;
use service_orchestration::{stop_registered, STOP_GRACE};

use crate::context;

pub async fn run(project: &Path, services: Vec<String>) -> Result<u8> {
    let project_dir = context::project_dir(project)?;
    let ctx = context::run_context(&project_dir);

    let filter = if services.is_empty() {
        None
    } else {
        Some(services.as_slice())
    };

    let stopped = stop_registered(&ctx, filter, STOP_GRACE).await?;
    if stopped.is_empty() {
        println!("No running services for this project");
    } else {
        for name in &stopped {
            println!("Stopped {}", name);
        }
    }
    Ok(0)
}
