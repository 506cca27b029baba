//! `azd-app status`: table of registered services

use std::path::Path;

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Table};

use crate::context;

pub async fn run(project: &Path) -> Result<u8> {
    let project_dir = context::project_dir(project)?;
    let ctx = context::run_context(&project_dir);

    let entries = ctx.registry.list_by_project(&project_dir).await?;
    if entries.is_empty() {
        println!("No registered services for {}", project_dir.display());
        return Ok(0);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["SERVICE", "STATUS", "HEALTH", "PID", "URL", "LAST ERROR"]);
    for entry in &entries {
        table.add_row([
            entry.name.clone(),
            format!("{:?}", entry.status).to_lowercase(),
            format!("{:?}", entry.health).to_lowercase(),
            if entry.pid > 0 {
                entry.pid.to_string()
            } else {
                String::new()
            },
            entry.url.clone().unwrap_or_default(),
            entry.last_error.clone().unwrap_or_default(),
        ]);
    }
    println!("{}", table);
    Ok(0)
}
