//! Targeted manifest writeback for auto-assigned ports
//!
//! The port manager is the only writer of the manifest, and it only ever
//! touches the `ports` entries of a single service. The rewrite is
//! line-based: every other line of the file, including comments and key
//! ordering, comes through byte-identical.

use std::path::Path;

use regex::Regex;
use tracing::debug;

use crate::{ConfigError, Result};

/// Persist new port strings for one service into the manifest file
///
/// The file is rewritten atomically (temp + rename in the same directory).
/// Writing is skipped entirely when nothing changed.
pub fn write_ports_back(
    manifest_path: impl AsRef<Path>,
    service_name: &str,
    new_ports: &[String],
) -> Result<()> {
    let manifest_path = manifest_path.as_ref();
    let content = std::fs::read_to_string(manifest_path)?;
    let updated = rewrite_ports(&content, service_name, new_ports)?;
    if updated == content {
        return Ok(());
    }

    let dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        manifest_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "azure.yaml".to_string())
    ));
    std::fs::write(&tmp, &updated)?;
    std::fs::rename(&tmp, manifest_path)?;

    debug!(
        service = service_name,
        ports = ?new_ports,
        "manifest ports updated in {}",
        manifest_path.display()
    );
    Ok(())
}

/// Rewrite the `ports` entries of `service_name`, returning the new text
pub fn rewrite_ports(content: &str, service_name: &str, new_ports: &[String]) -> Result<String> {
    let lines: Vec<&str> = content.lines().collect();

    let name_re = Regex::new(&format!(
        r#"^(\s*)-\s+name:\s*["']?{}["']?\s*(#.*)?$"#,
        regex::escape(service_name)
    ))
    .expect("static regex");

    let (item_line, item_indent) = lines
        .iter()
        .enumerate()
        .find_map(|(i, line)| {
            name_re
                .captures(line)
                .map(|caps| (i, caps.get(1).map(|m| m.as_str().len()).unwrap_or(0)))
        })
        .ok_or_else(|| {
            ConfigError::Validation(format!(
                "service '{}' not found in manifest during port writeback",
                service_name
            ))
        })?;

    // The service block runs until the next sibling list item or a
    // shallower key.
    let mut block_end = lines.len();
    for (i, line) in lines.iter().enumerate().skip(item_line + 1) {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - trimmed.len();
        if indent <= item_indent {
            block_end = i;
            break;
        }
    }

    let ports_re = Regex::new(r"^(\s*)ports:\s*(.*)$").expect("static regex");
    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();

    for i in item_line + 1..block_end {
        let Some(caps) = ports_re.captures(lines[i]) else {
            continue;
        };
        let key_indent = caps.get(1).map(|m| m.as_str().len()).unwrap_or(0);
        let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");

        if rest.trim_start().starts_with('[') {
            // Inline flow sequence: rewrite between the brackets.
            let line = lines[i];
            let open = line.find('[').expect("checked above");
            let close = line.rfind(']').ok_or_else(|| {
                ConfigError::Validation(format!(
                    "unterminated ports array for service '{}'",
                    service_name
                ))
            })?;
            let rendered = new_ports
                .iter()
                .map(|p| format!("\"{}\"", p))
                .collect::<Vec<_>>()
                .join(", ");
            out[i] = format!("{}[{}]{}", &line[..open], rendered, &line[close + 1..]);
            return Ok(join_preserving_trailing_newline(content, out));
        }

        // Block sequence: the item lines directly below, one per port.
        let mut first_item = None;
        let mut last_item = i;
        for (j, line) in lines.iter().enumerate().take(block_end).skip(i + 1) {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let indent = line.len() - trimmed.len();
            if indent > key_indent && trimmed.starts_with('-') {
                first_item.get_or_insert(j);
                last_item = j;
            } else {
                break;
            }
        }
        let Some(first_item) = first_item else {
            return Err(ConfigError::Validation(format!(
                "ports entry for service '{}' has no items",
                service_name
            )));
        };

        let item_prefix = {
            let line = lines[first_item];
            let trimmed = line.trim_start();
            &line[..line.len() - trimmed.len()]
        };
        let rendered: Vec<String> = new_ports
            .iter()
            .map(|p| format!("{}- \"{}\"", item_prefix, p))
            .collect();
        out.splice(first_item..=last_item, rendered);
        return Ok(join_preserving_trailing_newline(content, out));
    }

    Err(ConfigError::Validation(format!(
        "service '{}' has no ports entry to update",
        service_name
    )))
}

fn join_preserving_trailing_newline(original: &str, lines: Vec<String>) -> String {
    let mut joined = lines.join("\n");
    if original.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"# project manifest
project:
  name: shop
  services:
    # the storefront
    - name: web
      kind: native
      command: ["node", "server.js"]
      ports:
        - "3000"
      env:
        NODE_ENV: development
    - name: api
      kind: native
      command: ["uvicorn", "main:app"]
      ports: ["8080", "9090"]  # http + metrics
"#;

    #[test]
    fn test_block_sequence_rewrite() {
        let updated = rewrite_ports(MANIFEST, "web", &["3001".to_string()]).unwrap();
        assert!(updated.contains("        - \"3001\""));
        assert!(!updated.contains("- \"3000\""));
        // Everything else is untouched.
        assert!(updated.contains("# project manifest"));
        assert!(updated.contains("    # the storefront"));
        assert!(updated.contains("        NODE_ENV: development"));
        assert!(updated.contains("ports: [\"8080\", \"9090\"]  # http + metrics"));
    }

    #[test]
    fn test_inline_sequence_rewrite_keeps_comment() {
        let updated =
            rewrite_ports(MANIFEST, "api", &["8081".to_string(), "9090".to_string()]).unwrap();
        assert!(updated.contains("ports: [\"8081\", \"9090\"]  # http + metrics"));
        // The other service is untouched.
        assert!(updated.contains("- \"3000\""));
    }

    #[test]
    fn test_unknown_service() {
        assert!(matches!(
            rewrite_ports(MANIFEST, "ghost", &["1".to_string()]).unwrap_err(),
            ConfigError::Validation(_)
        ));
    }

    #[test]
    fn test_item_count_can_change() {
        let updated = rewrite_ports(
            MANIFEST,
            "web",
            &["3001".to_string(), "3002".to_string()],
        )
        .unwrap();
        assert!(updated.contains("        - \"3001\"\n        - \"3002\""));
    }

    #[test]
    fn test_write_ports_back_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure.yaml");
        std::fs::write(&path, MANIFEST).unwrap();

        write_ports_back(&path, "web", &["3005".to_string()]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("- \"3005\""));
        assert!(content.ends_with('\n'));
        // No temp file left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
