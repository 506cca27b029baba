//! Resolving a service spec into a launchable command

use app_config::{ServiceKind, ServiceSpec};
use command_executor::{validate, Command};

use crate::{Error, Result};

/// Build the child command for a service
///
/// The argv comes from the manifest where declared; otherwise each kind has
/// its conventional launcher. The child inherits the parent environment,
/// then the service's `env` map, then `PORT` for native services so the app
/// knows which port it was assigned.
pub fn resolve_command(spec: &ServiceSpec, assigned_port: u16) -> Result<Command> {
    let argv = resolve_argv(spec)?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Config(format!("service '{}' has an empty command", spec.name)))?;

    validate::validate_executable(program)?;

    let workdir = spec.effective_workdir();
    if workdir != &spec.project_dir {
        validate::validate_workdir(workdir, &spec.project_dir)?;
    }

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(workdir);
    cmd.envs(spec.env.iter());

    if assigned_port > 0 && !spec.kind.is_containerized() {
        // Explicit manifest env still wins over the convention.
        if !spec.env.contains_key("PORT") {
            cmd.env("PORT", assigned_port.to_string());
        }
    }

    Ok(cmd)
}

fn resolve_argv(spec: &ServiceSpec) -> Result<Vec<String>> {
    if !spec.command.is_empty() {
        return Ok(spec.command.clone());
    }

    if let Some(script) = &spec.script {
        validate::ensure_no_shell_metacharacters(script)?;
        return match spec.language.as_deref() {
            Some("js") | Some("ts") | Some("javascript") | Some("typescript") | None => Ok(vec![
                "npm".to_string(),
                "run".to_string(),
                script.clone(),
            ]),
            Some(other) => Err(Error::Config(format!(
                "service '{}': scripts are not supported for language '{}'",
                spec.name, other
            ))),
        };
    }

    match spec.kind {
        ServiceKind::Native => Err(Error::Config(format!(
            "native service '{}' needs a command or a script",
            spec.name
        ))),
        ServiceKind::Aspire => Ok(vec![
            "dotnet".to_string(),
            "run".to_string(),
            "--project".to_string(),
            spec.project_dir.display().to_string(),
        ]),
        // Compose stacks run attached so the child's lifetime is the
        // stack's lifetime and SIGTERM tears the containers down.
        ServiceKind::Compose | ServiceKind::Docker => Ok(vec![
            "docker".to_string(),
            "compose".to_string(),
            "up".to_string(),
            "--no-color".to_string(),
        ]),
    }
}
