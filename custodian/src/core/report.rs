//! Structured results for verification passes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::classifier::FailureKind;

/// Captured execution of a single verification command.
///
/// Immutable once produced. `kind` is `None` exactly when `passed` is true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// 1-based position within the verification pass.
    pub index: usize,
    /// Total number of commands in the pass.
    pub total: usize,
    /// The original command string as configured.
    pub command: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub duration_ms: u64,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

impl CommandResult {
    pub fn kind_str(&self) -> &'static str {
        self.kind.map(FailureKind::as_str).unwrap_or("")
    }
}

/// Ordered results for one verification pass.
///
/// Invariant: if any entry has `passed == false` it is the last entry
/// (stop-on-first-failure); all preceding entries passed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub commands: Vec<CommandResult>,
}

impl Report {
    /// The first (and, by invariant, only) failing result, if any.
    pub fn first_failure(&self) -> Option<&CommandResult> {
        self.commands.iter().find(|c| !c.passed)
    }
}

/// Distinguished error for a failed verification command.
///
/// Carried inside `anyhow::Error` so callers can branch on it via
/// `downcast_ref` while still getting full context chains.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    pub result: CommandResult,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command failed: {} (exit={}, kind={})",
            self.result.command,
            self.result.exit_code,
            self.result.kind_str()
        )
    }
}

impl std::error::Error for CommandFailure {}
