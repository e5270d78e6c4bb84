//! Applies proposed file writes to the working tree.
//!
//! Paths are validated against policy before this layer runs, but path
//! hygiene is re-checked here so a bad proposal can never write outside the
//! repository root.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::plan::{Plan, PlanFile};

/// Apply every `write`-mode file in the proposal. Unknown modes are an
/// error, not a skip.
pub fn apply_plan(root: &Path, plan: &Plan) -> Result<usize> {
    let mut written = 0usize;
    for file in &plan.files {
        match file.mode.as_str() {
            "" | "write" => {
                write_file(root, file)?;
                written += 1;
            }
            other => {
                return Err(anyhow!(
                    "unsupported file mode {other:?} for path {:?}",
                    file.path
                ));
            }
        }
    }
    info!(files = written, "proposal applied");
    Ok(written)
}

fn write_file(root: &Path, file: &PlanFile) -> Result<()> {
    let rel = safe_rel_path(&file.path)?;
    let target = root.join(&rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent directories for {}", target.display()))?;
    }
    fs::write(&target, &file.content)
        .with_context(|| format!("write {}", target.display()))?;
    debug!(path = %rel.display(), bytes = file.content.len(), "file written");
    Ok(())
}

/// Normalize a proposed path, rejecting anything that could leave the root.
pub fn safe_rel_path(path: &str) -> Result<PathBuf> {
    if path.trim().is_empty() {
        return Err(anyhow!("empty file path in proposal"));
    }
    if path.contains('\0') {
        return Err(anyhow!("invalid file path in proposal: {path:?}"));
    }
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Err(anyhow!("absolute file path in proposal: {path:?}"));
    }
    let mut rel = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(name) => rel.push(name),
            _ => return Err(anyhow!("unsafe file path in proposal: {path:?}")),
        }
    }
    if rel.as_os_str().is_empty() {
        return Err(anyhow!("empty file path in proposal"));
    }
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(path: &str, mode: &str, content: &str) -> Plan {
        Plan {
            summary: "test".to_string(),
            files: vec![PlanFile {
                path: path.to_string(),
                mode: mode.to_string(),
                content: content.to_string(),
            }],
            ..Plan::default()
        }
    }

    #[test]
    fn writes_file_with_parent_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_with("a/b/c.txt", "write", "hello");
        let written = apply_plan(temp.path(), &plan).expect("apply");
        assert_eq!(written, 1);
        let body = fs::read_to_string(temp.path().join("a/b/c.txt")).expect("read");
        assert_eq!(body, "hello");
    }

    #[test]
    fn empty_mode_defaults_to_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_with("f.txt", "", "x");
        apply_plan(temp.path(), &plan).expect("apply");
        assert!(temp.path().join("f.txt").exists());
    }

    #[test]
    fn unknown_mode_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_with("f.txt", "delete", "");
        let err = apply_plan(temp.path(), &plan).unwrap_err();
        assert!(err.to_string().contains("delete"));
        assert!(!temp.path().join("f.txt").exists());
    }

    #[test]
    fn rejects_escaping_paths() {
        for bad in ["", "  ", "/etc/passwd", "../secret", "a/../../b", "a\0b"] {
            assert!(safe_rel_path(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn normalizes_curdir_components() {
        assert_eq!(safe_rel_path("./a/./b").expect("path"), PathBuf::from("a/b"));
    }
}
