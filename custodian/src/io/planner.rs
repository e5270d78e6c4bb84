//! Adapter for the external plan generator.
//!
//! The generator is an arbitrary configured command run in the repository
//! root. It receives a JSON request on stdin and must print a single JSON
//! proposal on stdout. Anything it logs belongs on stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::plan::Plan;
use crate::io::process::{ExecSpec, run_argv};

/// Request for a regular improvement proposal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanRequest {
    pub repo_goal: String,
    pub policy: String,
    pub roadmap: String,
    pub changelog_tail: String,
}

/// Request for a repair proposal after a verification failure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairRequest {
    pub repo_goal: String,
    pub original_summary: String,
    pub failure_context: String,
    /// Capability ids the plan is allowed to reference, already filtered by
    /// failure kind.
    pub allowed_capabilities: Vec<String>,
}

/// Produces proposals. Trait so the orchestrator and driver can be driven by
/// scripted plans in tests.
pub trait PlanSource {
    fn generate_plan(&self, request: &PlanRequest) -> Result<Plan>;
    fn generate_repair_plan(&self, request: &RepairRequest) -> Result<Plan>;
}

/// Subprocess-backed plan source.
pub struct CommandPlanSource {
    workdir: PathBuf,
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandPlanSource {
    pub fn new(
        workdir: impl Into<PathBuf>,
        argv: Vec<String>,
        timeout_seconds: u64,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            argv,
            timeout: Duration::from_secs(timeout_seconds),
            output_limit_bytes,
        }
    }

    fn invoke(&self, kind: &str, request_json: Vec<u8>) -> Result<Plan> {
        if self.argv.is_empty() {
            return Err(anyhow!("no planner command configured"));
        }
        info!(kind, command = %self.argv.join(" "), "plan generator started");

        let output = run_argv(&ExecSpec {
            argv: self.argv.clone(),
            cwd: Some(self.workdir.clone()),
            stdin: Some(request_json),
            timeout: Some(self.timeout),
            output_limit_bytes: self.output_limit_bytes,
            echo: false,
        })?;

        if output.timed_out {
            return Err(anyhow!(
                "plan generator timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "plan generator exited with status {}: {}",
                output.exit_code(),
                output.stderr_lossy().trim()
            ));
        }

        let stdout = output.stdout_lossy();
        let plan = parse_plan(&stdout)?;
        debug!(
            kind,
            files = plan.files.len(),
            actions = plan.repair_actions.len(),
            "plan generator produced proposal"
        );
        Ok(plan)
    }
}

impl PlanSource for CommandPlanSource {
    fn generate_plan(&self, request: &PlanRequest) -> Result<Plan> {
        let body = serde_json::to_vec(request).context("encode plan request")?;
        self.invoke("plan", body)
    }

    fn generate_repair_plan(&self, request: &RepairRequest) -> Result<Plan> {
        let body = serde_json::to_vec(request).context("encode repair request")?;
        self.invoke("repair", body)
    }
}

/// Parse a proposal from generator stdout, tolerating surrounding noise.
///
/// Generators occasionally print banners before the JSON object; we parse
/// from the first `{` onward.
pub fn parse_plan(stdout: &str) -> Result<Plan> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("plan generator produced no output"));
    }
    let start = trimmed
        .find('{')
        .ok_or_else(|| anyhow!("plan generator output contains no JSON object"))?;
    serde_json::from_str(&trimmed[start..]).context("parse plan generator output")
}
