//! Execution of allowlisted repair capabilities.
//!
//! A capability is an argv-defined remediation command with its own deadline
//! and a sandboxed working directory under the repo root. Timeouts are a
//! distinguished error and are never classified (there is no output worth
//! classifying, only "it ran too long"). A non-timeout failure whose output
//! classifies as `security_integrity` fails the whole repair loop closed.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{error, info};

use crate::core::classifier::{self, FailureKind};
use crate::io::config::RepairCapability;
use crate::io::process::{ExecSpec, run_argv};

/// Runs one capability to completion. Trait so the orchestrator can be
/// scripted in tests.
pub trait CapabilityRunner {
    fn execute(&self, capability: &RepairCapability) -> Result<()>;
}

/// Distinguished error for a capability deadline expiry.
#[derive(Debug, Clone)]
pub struct CapabilityTimeout {
    pub id: String,
    pub timeout_seconds: u64,
}

impl fmt::Display for CapabilityTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "repair capability {} timed out after {}s",
            self.id, self.timeout_seconds
        )
    }
}

impl std::error::Error for CapabilityTimeout {}

/// Distinguished fail-closed error: a remediation command produced
/// integrity-failure output. Callers must treat this as terminal for the
/// whole repair loop, not just the capability.
#[derive(Debug, Clone)]
pub struct IntegrityViolation {
    pub id: String,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "security-integrity failure while executing repair capability {}",
            self.id
        )
    }
}

impl std::error::Error for IntegrityViolation {}

/// Subprocess-backed capability runner rooted at the repository.
pub struct ProcessCapabilityRunner {
    root: PathBuf,
    output_limit_bytes: usize,
}

impl ProcessCapabilityRunner {
    pub fn new(root: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            root: root.into(),
            output_limit_bytes,
        }
    }
}

impl CapabilityRunner for ProcessCapabilityRunner {
    fn execute(&self, capability: &RepairCapability) -> Result<()> {
        execute_capability(&self.root, capability, self.output_limit_bytes)
    }
}

/// Run a single capability under its deadline.
pub fn execute_capability(
    root: &Path,
    capability: &RepairCapability,
    output_limit_bytes: usize,
) -> Result<()> {
    if capability.argv.is_empty() {
        return Err(anyhow!("repair capability {} has empty argv", capability.id));
    }
    let cwd = resolve_safe_cwd(root, &capability.cwd)?;
    let command_display = capability.display_command();

    info!(
        id = %capability.id,
        command = %command_display,
        cwd = %cwd.display(),
        timeout_seconds = capability.timeout_seconds,
        "repair capability command started"
    );
    let started = Instant::now();

    let output = run_argv(&ExecSpec {
        argv: capability.argv.clone(),
        cwd: Some(cwd),
        stdin: None,
        timeout: Some(Duration::from_secs(capability.timeout_seconds)),
        output_limit_bytes,
        echo: true,
    })?;
    let duration_ms = started.elapsed().as_millis() as u64;

    if output.timed_out {
        error!(id = %capability.id, command = %command_display, duration_ms, "repair capability command timed out");
        return Err(anyhow::Error::new(CapabilityTimeout {
            id: capability.id.clone(),
            timeout_seconds: capability.timeout_seconds,
        }));
    }

    if !output.status.success() {
        let kind = classifier::classify_output(&command_display, &output.stdout_lossy(), &output.stderr_lossy());
        error!(
            id = %capability.id,
            command = %command_display,
            duration_ms,
            exit_code = output.exit_code(),
            kind = %kind,
            "repair capability command failed"
        );
        if kind == FailureKind::SecurityIntegrity {
            return Err(anyhow::Error::new(IntegrityViolation {
                id: capability.id.clone(),
            }));
        }
        return Err(anyhow!(
            "repair capability {} exited with status {}",
            capability.id,
            output.exit_code()
        ));
    }

    info!(id = %capability.id, command = %command_display, duration_ms, "repair capability command succeeded");
    Ok(())
}

/// Resolve a capability working directory, rejecting escapes from the root.
///
/// Empty and `.` resolve to the root. Absolute paths and any segment equal to
/// or beginning with `..` are rejected.
pub fn resolve_safe_cwd(root: &Path, cwd: &str) -> Result<PathBuf> {
    let cwd = cwd.trim();
    if cwd.is_empty() || cwd == "." {
        return Ok(root.to_path_buf());
    }
    let path = Path::new(cwd);
    if path.is_absolute() {
        return Err(anyhow!("unsafe repair capability cwd: {cwd:?}"));
    }
    let mut resolved = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(name) => {
                if name.to_string_lossy().starts_with("..") {
                    return Err(anyhow!("unsafe repair capability cwd: {cwd:?}"));
                }
                resolved.push(name);
            }
            _ => return Err(anyhow!("unsafe repair capability cwd: {cwd:?}")),
        }
    }
    Ok(resolved)
}
