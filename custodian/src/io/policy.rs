//! First-run scaffolding and audit-file maintenance.
//!
//! Bootstrap is write-if-missing: an existing file is never touched, so an
//! operator's edits survive every run.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::io::config::{self, Config};

const POLICY_TEMPLATE: &str = "\
# Policy

Rules the automated custodian must follow in this repository.

- Keep changes small and reviewable.
- Never touch CI workflow definitions.
- Every change must keep the verification commands passing.
";

const ROADMAP_TEMPLATE: &str = "\
# Roadmap

Near-term improvements for the custodian to work through, one per line.

- Improve test coverage in under-tested modules.
- Keep documentation in sync with behavior.
";

const CHANGELOG_TEMPLATE: &str = "\
# Changelog

Entries are appended by the custodian, newest last.
";

/// Ensure the config file and audit documents exist.
pub fn bootstrap(root: &Path, cfg: &Config) -> Result<()> {
    let config_path = root.join(config::CONFIG_RELATIVE_PATH);
    if !config_path.exists() {
        config::write_config(&config_path, cfg)?;
        info!(path = %config_path.display(), "wrote default config");
    }
    // Keep run state, lock, and config out of the repository history.
    write_if_missing(&root.join(".custodian/.gitignore"), "*\n")?;
    write_if_missing(&root.join("POLICY.md"), POLICY_TEMPLATE)?;
    write_if_missing(&root.join("ROADMAP.md"), ROADMAP_TEMPLATE)?;
    write_if_missing(&root.join("CHANGELOG.md"), CHANGELOG_TEMPLATE)?;
    Ok(())
}

fn write_if_missing(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, content).with_context(|| format!("write {}", path.display()))?;
    info!(path = %path.display(), "wrote template");
    Ok(())
}

/// Read a root-level document, or empty if absent.
pub fn read_doc(root: &Path, name: &str) -> String {
    fs::read_to_string(root.join(name)).unwrap_or_default()
}

/// Last `max_lines` lines of the changelog, for planner context.
pub fn changelog_tail(root: &Path, max_lines: usize) -> String {
    let body = read_doc(root, "CHANGELOG.md");
    let lines: Vec<&str> = body.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Append a dated entry to CHANGELOG.md.
pub fn append_changelog(root: &Path, entry: &str) -> Result<()> {
    let entry = entry.trim();
    if entry.is_empty() {
        return Ok(());
    }
    let path = root.join("CHANGELOG.md");
    let mut body = fs::read_to_string(&path).unwrap_or_default();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    let date = Utc::now().format("%Y-%m-%d");
    body.push_str(&format!("\n## {date}\n\n{entry}\n"));
    fs::write(&path, body).with_context(|| format!("write {}", path.display()))
}

/// Replace ROADMAP.md wholesale when the proposal carries an update.
pub fn update_roadmap(root: &Path, content: &str) -> Result<()> {
    let content = content.trim();
    if content.is_empty() {
        return Ok(());
    }
    let path = root.join("ROADMAP.md");
    let mut body = content.to_string();
    body.push('\n');
    fs::write(&path, body).with_context(|| format!("write {}", path.display()))
}
