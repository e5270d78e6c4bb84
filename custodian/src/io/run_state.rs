//! Durable cross-run health record and the exclusive run lock.
//!
//! State is persisted after every `start`/`finish` via atomic replace (temp
//! file + rename) so a kill mid-write never leaves a torn file. The run log
//! is append-only and never rewritten.
//!
//! Holding the run lock is a precondition for using [`Recorder`]: the state
//! file has no locking of its own.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Aggregate counters and recent outcomes across runs.
///
/// Zero-valued on first use (absent file). Field names match the persisted
/// `state.json` contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_started_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_finished_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_success_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_outcome: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_change_summary: String,
    pub total_runs: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_changed_runs: u64,
    pub consecutive_failures: u64,
    pub consecutive_noop: u64,
}

/// Persists run state and appends run-log events.
pub struct Recorder {
    state_path: PathBuf,
    log_path: PathBuf,
    state: RunState,
}

impl Recorder {
    /// Create a recorder, loading prior state if present.
    pub fn open(state_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Result<Self> {
        let state_path = state_path.into();
        let log_path = log_path.into();
        ensure_parent_dir(&state_path)?;
        ensure_parent_dir(&log_path)?;
        let state = load_state(&state_path)?;
        Ok(Self {
            state_path,
            log_path,
            state,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Mark a run as started and append a `start` event.
    pub fn start(&mut self) -> Result<()> {
        let now = rfc3339_now();
        self.state.total_runs += 1;
        self.state.last_started_at = now;
        self.state.last_outcome = "running".to_string();
        self.save()?;
        self.append_log("start", "")
    }

    /// Record run completion and append a terminal event.
    ///
    /// Errors increment the failure streak without touching the no-op streak;
    /// successes reset the failure streak and advance either the changed
    /// counter or the no-op streak.
    pub fn finish(&mut self, changed: bool, summary: &str, run_err: Option<&anyhow::Error>) -> Result<()> {
        let now = rfc3339_now();
        self.state.last_finished_at = now.clone();

        if let Some(err) = run_err {
            let message = format!("{err:#}");
            self.state.total_failures += 1;
            self.state.consecutive_failures += 1;
            self.state.last_error_at = now;
            self.state.last_outcome = "error".to_string();
            self.state.last_error = message.clone();
            self.save()?;
            return self.append_log("error", &message);
        }

        self.state.total_successes += 1;
        self.state.consecutive_failures = 0;
        self.state.last_success_at = now;
        self.state.last_error.clear();
        self.state.last_change_summary = summary.to_string();

        let event = if changed {
            self.state.total_changed_runs += 1;
            self.state.consecutive_noop = 0;
            self.state.last_outcome = "changed".to_string();
            "changed"
        } else {
            self.state.consecutive_noop += 1;
            self.state.last_outcome = "noop".to_string();
            "noop"
        };

        self.save()?;
        self.append_log(event, summary)
    }

    fn save(&self) -> Result<()> {
        debug!(path = %self.state_path.display(), outcome = %self.state.last_outcome, "writing run state");
        let mut buf = serde_json::to_string_pretty(&self.state).context("serialize run state")?;
        buf.push('\n');
        let tmp_path = self.state_path.with_extension("json.tmp");
        fs::write(&tmp_path, &buf)
            .with_context(|| format!("write temp run state {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.state_path)
            .with_context(|| format!("replace run state {}", self.state_path.display()))?;
        Ok(())
    }

    fn append_log(&self, event: &str, message: &str) -> Result<()> {
        let mut line = format!("{} event={}", rfc3339_now(), event);
        if !message.is_empty() {
            line.push_str(&format!(" message={message:?}"));
        }
        line.push('\n');
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.log_path)
            .with_context(|| format!("open run log {}", self.log_path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append run log {}", self.log_path.display()))?;
        Ok(())
    }
}

fn load_state(path: &Path) -> Result<RunState> {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("parse run state {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RunState::default()),
        Err(err) => Err(err).with_context(|| format!("read run state {}", path.display())),
    }
}

/// Distinguished error for a held lock so the CLI can map it to its own exit
/// code.
#[derive(Debug, Clone)]
pub struct LockHeld {
    pub path: PathBuf,
}

impl std::fmt::Display for LockHeld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock already held: {}", self.path.display())
    }
}

impl std::error::Error for LockHeld {}

/// Exclusive run lock. Removed on drop; [`LockGuard::release`] surfaces
/// removal errors for callers that want them.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        fs::remove_file(&self.path)
            .with_context(|| format!("remove lock {}", self.path.display()))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to remove lock file");
        }
    }
}

/// Acquire the run lock, reclaiming a stale one.
///
/// A single non-blocking attempt: exclusive create, and on contention one
/// retry only if the existing file's age exceeds `stale_after`
/// (`stale_after == 0` disables reclamation). The file's existence is the
/// mutual-exclusion token; its payload is diagnostic only.
pub fn acquire_lock(path: &Path, stale_after: Duration) -> Result<LockGuard> {
    ensure_parent_dir(path)?;
    match try_create_lock(path) {
        Ok(()) => {
            return Ok(LockGuard {
                path: path.to_path_buf(),
                released: false,
            });
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(err) => {
            return Err(err).with_context(|| format!("create lock {}", path.display()));
        }
    }

    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("stat lock {}", path.display()))?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if !stale_after.is_zero() && age > stale_after {
        warn!(path = %path.display(), age_secs = age.as_secs(), "reclaiming stale lock");
        fs::remove_file(path).with_context(|| format!("remove stale lock {}", path.display()))?;
        if try_create_lock(path).is_ok() {
            return Ok(LockGuard {
                path: path.to_path_buf(),
                released: false,
            });
        }
    }
    Err(anyhow::Error::new(LockHeld {
        path: path.to_path_buf(),
    }))
}

fn try_create_lock(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "pid={} started={}", std::process::id(), rfc3339_now())
}

fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
    }
    Ok(())
}
