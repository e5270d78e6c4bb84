//! Verification runner: ordered commands against the working tree.
//!
//! Commands are tokenized on whitespace and spawned directly; shell
//! metacharacters are not honored. Output is streamed to the operator and
//! captured for classification. Execution stops at the first non-zero exit;
//! retries are the repair orchestrator's concern, never this layer's.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use tracing::{error, info};

use crate::core::classifier;
use crate::core::report::{CommandResult, Report};
use crate::io::process::{ExecSpec, run_argv};

/// Runs one verification pass. Trait so the orchestrator can be driven by
/// scripted reports in tests.
pub trait Verifier {
    /// Execute the pass. `Ok(report)` is returned for both passing and
    /// failing runs; a failing run's report ends with the classified failing
    /// entry. `Err` is reserved for runner-internal problems.
    fn verify(&self) -> Result<Report>;
}

/// Subprocess-backed verifier over configured command strings.
pub struct CommandVerifier {
    workdir: PathBuf,
    commands: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandVerifier {
    pub fn new(workdir: impl Into<PathBuf>, commands: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            workdir: workdir.into(),
            commands,
            output_limit_bytes,
        }
    }
}

impl Verifier for CommandVerifier {
    fn verify(&self) -> Result<Report> {
        let commands = if self.commands.is_empty() {
            infer_commands(&self.workdir)
        } else {
            self.commands.clone()
        };
        run_commands_report(&self.workdir, &commands, self.output_limit_bytes)
    }
}

/// Execute verification commands in order, stopping at the first failure.
pub fn run_commands_report(
    workdir: &Path,
    commands: &[String],
    output_limit_bytes: usize,
) -> Result<Report> {
    info!(count = commands.len(), "verification commands prepared");
    let total = commands.len();
    let mut report = Report::default();

    for (i, command) in commands.iter().enumerate() {
        let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            continue;
        }

        let index = i + 1;
        info!(index, total, command = %command, "verification command started");
        let started = Instant::now();

        let spec = ExecSpec {
            argv,
            cwd: Some(workdir.to_path_buf()),
            stdin: None,
            // Known gap: no per-command deadline here. Operators must bound
            // long verification commands themselves.
            timeout: None,
            output_limit_bytes,
            echo: true,
        };

        // A command we cannot even spawn still produces a classifiable
        // result (exit -1) rather than aborting the pass.
        let (exit_code, stdout, stderr) = match run_argv(&spec) {
            Ok(output) => (output.exit_code(), output.stdout_lossy(), output.stderr_lossy()),
            Err(err) => (-1, String::new(), format!("{err:#}")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let passed = exit_code == 0;

        let mut result = CommandResult {
            index,
            total,
            command: command.clone(),
            exit_code,
            stdout,
            stderr,
            duration_ms,
            passed,
            kind: None,
        };

        if passed {
            info!(index, total, command = %command, duration_ms, "verification command succeeded");
            report.commands.push(result);
            continue;
        }

        result.kind = Some(classifier::classify(&result));
        error!(
            index,
            total,
            command = %command,
            duration_ms,
            exit_code,
            kind = %result.kind_str(),
            "verification command failed"
        );
        report.commands.push(result);
        return Ok(report);
    }

    Ok(report)
}

/// Derive a default command list from marker files when none is configured.
fn infer_commands(workdir: &Path) -> Vec<String> {
    if workdir.join("go.mod").exists() {
        return vec!["go test ./...".to_string()];
    }
    if workdir.join("Cargo.toml").exists() {
        return vec!["cargo test".to_string()];
    }
    if workdir.join("package.json").exists() {
        return vec!["npm test".to_string()];
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::FailureKind;
    use std::fs;

    fn run(commands: &[&str]) -> Report {
        let temp = tempfile::tempdir().expect("tempdir");
        run_commands_report(
            temp.path(),
            &commands.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            100_000,
        )
        .expect("report")
    }

    #[test]
    fn all_passing_commands_produce_full_report() {
        let report = run(&["true", "echo done"]);
        assert_eq!(report.commands.len(), 2);
        assert!(report.first_failure().is_none());
        assert_eq!(report.commands[1].index, 2);
        assert_eq!(report.commands[1].total, 2);
    }

    #[test]
    fn stops_at_first_failure_and_classifies_it() {
        let report = run(&["true", "false", "echo never-reached"]);
        assert_eq!(report.commands.len(), 2);
        let failure = report.first_failure().expect("failure");
        assert_eq!(failure.command, "false");
        assert_eq!(failure.exit_code, 1);
        assert!(!failure.passed);
        assert_eq!(failure.kind, Some(FailureKind::UnknownFailure));
    }

    #[test]
    fn failing_entry_is_always_last() {
        let report = run(&["true", "false"]);
        let last = report.commands.last().expect("entry");
        assert!(!last.passed);
        assert!(report.commands[..report.commands.len() - 1].iter().all(|c| c.passed));
    }

    #[test]
    fn unspawnable_command_yields_exit_minus_one() {
        let report = run(&["definitely-not-a-real-binary-xyz"]);
        let failure = report.first_failure().expect("failure");
        assert_eq!(failure.exit_code, -1);
        assert!(failure.kind.is_some());
    }

    #[test]
    fn captures_stdout_for_classification() {
        let report = run(&["cat /definitely/missing/path"]);
        let failure = report.first_failure().expect("failure");
        assert_eq!(failure.kind, Some(FailureKind::EnvMissingPath));
    }

    #[test]
    fn blank_command_strings_are_skipped() {
        let report = run(&["   ", "true"]);
        assert_eq!(report.commands.len(), 1);
        assert_eq!(report.commands[0].command, "true");
    }

    #[test]
    fn infers_commands_from_marker_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(infer_commands(temp.path()).is_empty());
        fs::write(temp.path().join("Cargo.toml"), "[package]").expect("write");
        assert_eq!(infer_commands(temp.path()), vec!["cargo test".to_string()]);
        fs::write(temp.path().join("go.mod"), "module x").expect("write");
        assert_eq!(infer_commands(temp.path()), vec!["go test ./...".to_string()]);
    }
}
