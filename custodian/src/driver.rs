//! Top-level run pipeline: plan, apply, verify with repair, commit.
//!
//! The reliability bracket (lock, recorder) wraps everything so a crash or
//! failure still leaves an honest `state.json` and run log behind. Once the
//! working tree has been mutated, any fatal error resets it.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info};

use crate::core::plan::{self, Plan};
use crate::io::apply::apply_plan;
use crate::io::capability::{CapabilityRunner, ProcessCapabilityRunner};
use crate::io::config::{self, Config};
use crate::io::git::{ChangeGauge, Git, GitChangeGauge};
use crate::io::planner::{CommandPlanSource, PlanRequest, PlanSource};
use crate::io::policy;
use crate::io::run_state::{Recorder, acquire_lock};
use crate::io::verify::{CommandVerifier, Verifier};
use crate::repair::{RepairSettings, verify_with_repair};

const CHANGELOG_TAIL_LINES: usize = 40;

/// What one run did, for the recorder and the operator.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub changed: bool,
    pub summary: String,
}

/// Load config relative to `workdir` and execute one full run.
pub fn run(workdir: &Path) -> Result<RunOutcome> {
    let cfg = config::load_config(&workdir.join(config::CONFIG_RELATIVE_PATH))?;
    run_with_config(workdir, &cfg)
}

/// Execute one full run under the reliability bracket.
pub fn run_with_config(root: &Path, cfg: &Config) -> Result<RunOutcome> {
    policy::bootstrap(root, cfg)?;

    let lock_path = root.join(&cfg.reliability.lock_file);
    let stale_after = Duration::from_secs(cfg.reliability.lock_stale_minutes * 60);
    let lock = acquire_lock(&lock_path, stale_after)?;

    let mut recorder = Recorder::open(
        root.join(&cfg.reliability.state_file),
        root.join(&cfg.reliability.run_log_file),
    )?;
    recorder.start()?;

    let git = Git::new(root);
    let planner = CommandPlanSource::new(
        root,
        cfg.planner.argv.clone(),
        cfg.planner.timeout_seconds,
        cfg.output_limit_bytes,
    );
    let verifier = CommandVerifier::new(root, cfg.commands.clone(), cfg.output_limit_bytes);
    let runner = ProcessCapabilityRunner::new(root, cfg.output_limit_bytes);
    let gauge = GitChangeGauge::new(root, cfg.budgets);

    let result = execute_run(root, cfg, &git, &planner, &verifier, &runner, &gauge);
    match &result {
        Ok(outcome) => recorder.finish(outcome.changed, &outcome.summary, None)?,
        Err(err) => {
            error!(err = %format!("{err:#}"), "run failed");
            recorder.finish(false, "", Some(err))?;
        }
    }
    lock.release()?;
    result
}

/// The pipeline proper, generic so tests can script every collaborator.
pub fn execute_run<P, V, C, G>(
    root: &Path,
    cfg: &Config,
    git: &Git,
    planner: &P,
    verifier: &V,
    runner: &C,
    gauge: &G,
) -> Result<RunOutcome>
where
    P: PlanSource,
    V: Verifier,
    C: CapabilityRunner,
    G: ChangeGauge,
{
    let request = PlanRequest {
        repo_goal: cfg.repo_goal.clone(),
        policy: policy::read_doc(root, "POLICY.md"),
        roadmap: policy::read_doc(root, "ROADMAP.md"),
        changelog_tail: policy::changelog_tail(root, CHANGELOG_TAIL_LINES),
    };
    let plan = log_step("plan", || planner.generate_plan(&request))?;

    if plan.is_empty() {
        info!("plan proposes no changes");
        return Ok(RunOutcome {
            changed: false,
            summary: "no changes proposed".to_string(),
        });
    }

    if cfg.security.secret_scan {
        log_step("secret_scan", || plan::scan_for_secrets(&plan))?;
    }
    log_step("validate_paths", || {
        plan::validate_paths(&plan, &cfg.deny_paths, cfg.security.allow_workflow_edits)
    })?;

    if cfg.mode == "branch" {
        let branch = format!("custodian/{}", Utc::now().format("%Y-%m-%d-%H%M%S"));
        log_step("branch", || git.checkout_new_branch(&branch))?;
    }

    // Everything below mutates the working tree; on failure, reset it so the
    // next run starts from a known state.
    let result = mutate_and_verify(root, cfg, git, verifier, planner, runner, gauge, &plan);
    if result.is_err() {
        git.reset_hard();
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn mutate_and_verify<P, V, C, G>(
    root: &Path,
    cfg: &Config,
    git: &Git,
    verifier: &V,
    planner: &P,
    runner: &C,
    gauge: &G,
    plan: &Plan,
) -> Result<RunOutcome>
where
    P: PlanSource,
    V: Verifier,
    C: CapabilityRunner,
    G: ChangeGauge,
{
    log_step("apply", || apply_plan(root, plan))?;
    log_step("changelog", || policy::append_changelog(root, &plan.changelog_entry))?;
    log_step("roadmap", || policy::update_roadmap(root, &plan.roadmap_update))?;

    let totals = log_step("budget", || gauge.check())?;
    if totals.is_empty() {
        info!("plan produced no effective diff");
        return Ok(RunOutcome {
            changed: false,
            summary: plan.summary.clone(),
        });
    }

    let settings = RepairSettings::from_config(cfg, &plan.summary);
    let outcome = log_step("verify", || {
        verify_with_repair(root, verifier, planner, runner, gauge, &settings)
    })?;
    if outcome.attempts_used > 0 {
        // Repairs may have grown the diff; the budget must still hold.
        log_step("budget_recheck", || gauge.check())?;
    }

    log_step("commit", || git.commit(&plan.summary))?;
    Ok(RunOutcome {
        changed: true,
        summary: plan.summary.clone(),
    })
}

fn log_step<T>(step: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    info!(step, "step started");
    let result = f().with_context(|| format!("step {step}"));
    match &result {
        Ok(_) => info!(step, "step finished"),
        Err(err) => error!(step, err = %format!("{err:#}"), "step failed"),
    }
    result
}
