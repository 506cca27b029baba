//! Validation of executables, script names and working directories

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Characters that would change meaning if the input ever reached a shell
///
/// Commands are executed positionally and never through a shell, but script
/// names from the manifest end up interpolated into package-manager argv
/// (`npm run <script>`), so they are rejected up front.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '$', '`', '>', '<', '(', ')', '{', '}', '[', ']', '*', '?', '~', '#', '!', '"',
    '\'', '\\', '\n', '\r',
];

/// Ensure a binary exists on PATH and resolve its full path
pub fn validate_executable(program: &str) -> Result<PathBuf> {
    if program.trim().is_empty() {
        return Err(Error::invalid_arg("executable name is empty"));
    }
    ensure_no_shell_metacharacters(program)?;
    which::which(program).map_err(|_| Error::NotFound {
        program: program.to_string(),
    })
}

/// Reject identifiers containing shell metacharacters
pub fn ensure_no_shell_metacharacters(input: &str) -> Result<()> {
    if let Some(bad) = input.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(Error::invalid_arg(format!(
            "'{}' contains forbidden character '{}'",
            input, bad
        )));
    }
    Ok(())
}

/// Ensure a working directory is absolute and stays inside the project root
pub fn validate_workdir(workdir: &Path, project_root: &Path) -> Result<()> {
    if !workdir.is_absolute() {
        return Err(Error::invalid_arg(format!(
            "working directory '{}' is not absolute",
            workdir.display()
        )));
    }
    let normalized = normalize(workdir);
    let root = normalize(project_root);
    if !normalized.starts_with(&root) {
        return Err(Error::invalid_arg(format!(
            "working directory '{}' escapes project root '{}'",
            workdir.display(),
            project_root.display()
        )));
    }
    Ok(())
}

/// Lexically resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
