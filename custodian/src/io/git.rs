//! Git adapter for the run pipeline.
//!
//! The driver commits deterministically and measures change budgets, so we
//! keep a small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::io::config::Budgets;

/// Measured size of the staged change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffTotals {
    pub files_changed: usize,
    pub lines_changed: usize,
    pub new_files: usize,
}

impl DiffTotals {
    pub fn is_empty(&self) -> bool {
        self.files_changed == 0 && self.lines_changed == 0 && self.new_files == 0
    }
}

/// Measures the working tree and enforces the change budget. Trait so the
/// orchestrator can be scripted in tests.
pub trait ChangeGauge {
    /// Stage everything, measure the diff, and fail if any budget maximum is
    /// exceeded.
    fn check(&self) -> Result<DiffTotals>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the working tree has any changes, staged or not.
    pub fn has_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["status", "--porcelain"])?;
        Ok(!out.trim().is_empty())
    }

    /// Stage all changes.
    pub fn stage_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Staged file and line-change counts from `diff --cached --numstat`.
    pub fn diff_stats(&self) -> Result<(usize, usize)> {
        let out = self.run_capture(&["diff", "--cached", "--numstat"])?;
        let mut files = 0usize;
        let mut lines = 0usize;
        for line in out.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() == 3 {
                files += 1;
                // Binary files report "-"; count them as zero lines.
                lines += parts[0].parse::<usize>().unwrap_or(0);
                lines += parts[1].parse::<usize>().unwrap_or(0);
            }
        }
        Ok((files, lines))
    }

    /// How many files are staged as newly added.
    pub fn new_files_count(&self) -> Result<usize> {
        let out = self.run_capture(&["diff", "--cached", "--name-status", "--diff-filter=A"])?;
        Ok(out.lines().filter(|l| !l.trim().is_empty()).count())
    }

    /// Discard tracked and untracked changes. Best-effort: cleanup on an
    /// already-failing path must not mask the original error.
    pub fn reset_hard(&self) {
        if let Err(err) = self.run_checked(&["reset", "--hard"]) {
            warn!(err = %err, "git reset --hard failed");
        }
        if let Err(err) = self.run_checked(&["clean", "-fd"]) {
            warn!(err = %err, "git clean -fd failed");
        }
    }

    /// Create and checkout a new branch at current HEAD.
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Stage everything and commit.
    pub fn commit(&self, message: &str) -> Result<()> {
        self.stage_all()?;
        self.run_checked(&["commit", "-m", message])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Git-backed [`ChangeGauge`]: stage, measure, enforce budgets.
pub struct GitChangeGauge {
    git: Git,
    budgets: Budgets,
}

impl GitChangeGauge {
    pub fn new(workdir: impl Into<PathBuf>, budgets: Budgets) -> Self {
        Self {
            git: Git::new(workdir),
            budgets,
        }
    }
}

impl ChangeGauge for GitChangeGauge {
    fn check(&self) -> Result<DiffTotals> {
        debug!("computing diff stats");
        self.git.stage_all()?;
        let (files_changed, lines_changed) = self.git.diff_stats()?;
        let new_files = self.git.new_files_count()?;
        let totals = DiffTotals {
            files_changed,
            lines_changed,
            new_files,
        };
        debug!(
            files_changed = totals.files_changed,
            lines_changed = totals.lines_changed,
            new_files = totals.new_files,
            "diff stats computed"
        );
        self.budgets.check(&totals)?;
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.run_checked(&["init", "-q"]).expect("init");
        git.run_checked(&["config", "user.name", "custodian-test"]).expect("config");
        git.run_checked(&["config", "user.email", "custodian-test@example.invalid"])
            .expect("config");
        fs::write(temp.path().join("README.md"), "# repo\n").expect("write");
        git.commit("initial").expect("commit");
        temp
    }

    #[test]
    fn clean_repo_has_no_changes() {
        let temp = init_repo();
        let git = Git::new(temp.path());
        assert!(!git.has_changes().expect("status"));
    }

    #[test]
    fn diff_stats_count_staged_files_and_lines() {
        let temp = init_repo();
        let git = Git::new(temp.path());
        fs::write(temp.path().join("new.txt"), "one\ntwo\n").expect("write");
        git.stage_all().expect("stage");
        let (files, lines) = git.diff_stats().expect("stats");
        assert_eq!(files, 1);
        assert_eq!(lines, 2);
        assert_eq!(git.new_files_count().expect("new files"), 1);
    }

    #[test]
    fn gauge_enforces_line_budget() {
        let temp = init_repo();
        fs::write(temp.path().join("big.txt"), "line\n".repeat(20)).expect("write");
        let tight = GitChangeGauge::new(
            temp.path(),
            Budgets {
                max_files_changed: 10,
                max_lines_changed: 5,
                max_new_files: 10,
            },
        );
        assert!(tight.check().is_err());
        let roomy = GitChangeGauge::new(temp.path(), Budgets::default());
        let totals = roomy.check().expect("totals");
        assert_eq!(totals.files_changed, 1);
        assert_eq!(totals.new_files, 1);
    }

    #[test]
    fn reset_hard_discards_changes() {
        let temp = init_repo();
        let git = Git::new(temp.path());
        fs::write(temp.path().join("junk.txt"), "x").expect("write");
        assert!(git.has_changes().expect("status"));
        git.reset_hard();
        assert!(!git.has_changes().expect("status"));
    }
}
