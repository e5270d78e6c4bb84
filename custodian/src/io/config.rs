//! Runtime configuration stored under `<workdir>/.custodian/config.toml`.
//!
//! The file is intended to be edited by humans; every field defaults so a
//! missing or partial file still yields a runnable config. Environment
//! variables (`CUSTODIAN_*`) override file values for CI-style invocations.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::io::git::DiffTotals;

pub const CONFIG_RELATIVE_PATH: &str = ".custodian/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// `branch` checks out a fresh branch before applying; `commit` commits
    /// on the current branch.
    pub mode: String,
    /// Long-term objective recorded in ROADMAP.md and handed to the planner.
    pub repo_goal: String,
    pub workdir: String,
    /// Verification commands, run in order. Empty means infer from marker
    /// files (go.mod, Cargo.toml, package.json).
    pub commands: Vec<String>,
    pub allow_paths: Vec<String>,
    pub deny_paths: Vec<String>,
    pub budgets: Budgets,
    pub security: Security,
    pub repair: Repair,
    pub reliability: Reliability,
    pub logging: Logging,
    pub planner: Planner,
    /// Truncate captured command output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Maxima on the size of a produced change, re-checked after every mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Budgets {
    pub max_files_changed: usize,
    pub max_lines_changed: usize,
    pub max_new_files: usize,
}

impl Budgets {
    /// Compare measured totals against the configured maxima.
    pub fn check(&self, totals: &DiffTotals) -> Result<()> {
        if totals.files_changed > self.max_files_changed
            || totals.lines_changed > self.max_lines_changed
            || totals.new_files > self.max_new_files
        {
            return Err(anyhow!(
                "budget exceeded: {} files, {} lines, {} new files (max {}/{}/{})",
                totals.files_changed,
                totals.lines_changed,
                totals.new_files,
                self.max_files_changed,
                self.max_lines_changed,
                self.max_new_files
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Security {
    pub allow_workflow_edits: bool,
    pub secret_scan: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Repair {
    /// Bound on full repair cycles per run.
    pub max_attempts: u32,
    /// Bound on capability actions one repair plan may request.
    pub max_actions_per_attempt: usize,
    pub capabilities: Vec<RepairCapability>,
}

/// An allowlisted, argv-defined remediation command the repair loop may
/// invoke by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepairCapability {
    /// Unique within the allowlist; requested by the plan generator.
    pub id: String,
    pub description: String,
    /// Executable plus arguments, spawned directly (no shell).
    pub argv: Vec<String>,
    pub timeout_seconds: u64,
    pub max_runs_per_attempt: u32,
    /// Failure kinds this capability applies to (case-insensitive). Empty
    /// means allowed for any repairable kind.
    pub allowed_failure_kinds: Vec<String>,
    /// Working directory relative to the repo root. Empty or `.` means the
    /// root itself; escapes are rejected at execution time.
    pub cwd: String,
}

impl Default for RepairCapability {
    fn default() -> Self {
        Self {
            id: String::new(),
            description: String::new(),
            argv: Vec::new(),
            timeout_seconds: 120,
            max_runs_per_attempt: 1,
            allowed_failure_kinds: Vec::new(),
            cwd: String::new(),
        }
    }
}

impl RepairCapability {
    /// Whether this capability may run for the given failure kind.
    pub fn allows(&self, kind: &str) -> bool {
        self.allowed_failure_kinds.is_empty()
            || self
                .allowed_failure_kinds
                .iter()
                .any(|k| k.trim().eq_ignore_ascii_case(kind.trim()))
    }

    pub fn display_command(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Reliability {
    pub state_file: String,
    pub run_log_file: String,
    pub lock_file: String,
    pub lock_stale_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    /// `text` or `json`.
    pub format: String,
    /// Optional log file, appended to alongside stderr output.
    pub file: String,
}

/// External plan-generator command. Receives a JSON request on stdin and
/// writes a plan as JSON to stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Planner {
    pub argv: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: "branch".to_string(),
            repo_goal: String::new(),
            workdir: ".".to_string(),
            commands: Vec::new(),
            allow_paths: vec![".".to_string()],
            deny_paths: vec![
                ".git/".to_string(),
                ".github/workflows/".to_string(),
                ".custodian/".to_string(),
                "node_modules/".to_string(),
            ],
            budgets: Budgets::default(),
            security: Security::default(),
            repair: Repair::default(),
            reliability: Reliability::default(),
            logging: Logging::default(),
            planner: Planner::default(),
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_files_changed: 10,
            max_lines_changed: 500,
            max_new_files: 10,
        }
    }
}

impl Default for Security {
    fn default() -> Self {
        Self {
            allow_workflow_edits: false,
            secret_scan: true,
        }
    }
}

impl Default for Repair {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_actions_per_attempt: 2,
            capabilities: Vec::new(),
        }
    }
}

impl Default for Reliability {
    fn default() -> Self {
        Self {
            state_file: ".custodian/state.json".to_string(),
            run_log_file: ".custodian/runs.log".to_string(),
            lock_file: ".custodian/run.lock".to_string(),
            lock_stale_minutes: 180,
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: String::new(),
        }
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self {
            argv: Vec::new(),
            timeout_seconds: 600,
        }
    }
}

impl Config {
    /// Misconfigurations are detected eagerly, before a run starts mutating
    /// anything.
    pub fn validate(&self) -> Result<()> {
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.repair.max_attempts == 0 {
            return Err(anyhow!("repair.max_attempts must be > 0"));
        }
        if self.repair.max_actions_per_attempt == 0 {
            return Err(anyhow!("repair.max_actions_per_attempt must be > 0"));
        }

        let mut seen = std::collections::HashSet::new();
        for cap in &self.repair.capabilities {
            let id = cap.id.trim();
            if id.is_empty() {
                return Err(anyhow!("repair capability with empty id"));
            }
            if !seen.insert(id.to_string()) {
                return Err(anyhow!("duplicate repair capability id in config: {id}"));
            }
            if cap.argv.is_empty() || cap.argv[0].trim().is_empty() {
                return Err(anyhow!("repair capability {id} has empty argv"));
            }
            if cap.timeout_seconds == 0 {
                return Err(anyhow!("repair capability {id} has zero timeout_seconds"));
            }
            if cap.max_runs_per_attempt == 0 {
                return Err(anyhow!("repair capability {id} has zero max_runs_per_attempt"));
            }
        }
        Ok(())
    }
}

/// Build config from defaults, file values, and environment overrides.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

fn apply_env_overrides(cfg: &mut Config) {
    override_string("CUSTODIAN_MODE", &mut cfg.mode);
    override_string("CUSTODIAN_REPO_GOAL", &mut cfg.repo_goal);
    override_string("CUSTODIAN_WORKDIR", &mut cfg.workdir);
    override_string("CUSTODIAN_STATE_FILE", &mut cfg.reliability.state_file);
    override_string("CUSTODIAN_RUN_LOG_FILE", &mut cfg.reliability.run_log_file);
    override_string("CUSTODIAN_LOCK_FILE", &mut cfg.reliability.lock_file);
    override_string("CUSTODIAN_LOG_LEVEL", &mut cfg.logging.level);
    override_string("CUSTODIAN_LOG_FILE", &mut cfg.logging.file);

    if let Ok(v) = std::env::var("CUSTODIAN_COMMANDS") {
        if !v.trim().is_empty() {
            cfg.commands = v
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    if std::env::var("CUSTODIAN_ALLOW_WORKFLOWS").is_ok_and(|v| v == "true") {
        cfg.security.allow_workflow_edits = true;
    }

    override_number("CUSTODIAN_MAX_FILES", &mut cfg.budgets.max_files_changed);
    override_number("CUSTODIAN_MAX_LINES", &mut cfg.budgets.max_lines_changed);
    override_number("CUSTODIAN_MAX_NEW_FILES", &mut cfg.budgets.max_new_files);
    override_number("CUSTODIAN_REPAIR_MAX_ATTEMPTS", &mut cfg.repair.max_attempts);
    override_number(
        "CUSTODIAN_REPAIR_MAX_ACTIONS",
        &mut cfg.repair.max_actions_per_attempt,
    );
    override_number(
        "CUSTODIAN_LOCK_STALE_MINUTES",
        &mut cfg.reliability.lock_stale_minutes,
    );
}

fn override_string(var: &str, target: &mut String) {
    if let Ok(v) = std::env::var(var) {
        if !v.trim().is_empty() {
            *target = v;
        }
    }
}

fn override_number<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(v) = std::env::var(var) {
        match v.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(var, value = %v, "ignoring unparsable env override"),
        }
    }
}
