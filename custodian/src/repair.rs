//! Verification with bounded repair.
//!
//! The orchestrator runs the verifier, and on failure drives up to
//! `max_attempts` full repair cycles: classify, ask the plan generator for a
//! repair proposal, apply it, execute its allowlisted capability actions, and
//! re-verify. Terminal failure kinds short-circuit before any plan
//! generation. The original verification failure always travels with the
//! returned error so the operator sees what actually broke.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::core::classifier::FailureKind;
use crate::core::failure_context::format_failure_context;
use crate::core::plan::{self, Plan};
use crate::core::report::{CommandFailure, CommandResult, Report};
use crate::io::apply::apply_plan;
use crate::io::capability::CapabilityRunner;
use crate::io::config::{Config, RepairCapability};
use crate::io::git::ChangeGauge;
use crate::io::planner::{PlanSource, RepairRequest};
use crate::io::verify::Verifier;

/// Knobs for one orchestrated verification, lifted from config.
#[derive(Debug, Clone)]
pub struct RepairSettings {
    pub max_attempts: u32,
    pub max_actions_per_attempt: usize,
    pub capabilities: Vec<RepairCapability>,
    pub repo_goal: String,
    /// Summary of the change under verification; repair plans inherit it when
    /// they carry none of their own.
    pub original_summary: String,
    pub deny_paths: Vec<String>,
    pub allow_workflow_edits: bool,
    pub secret_scan: bool,
}

impl RepairSettings {
    pub fn from_config(cfg: &Config, original_summary: &str) -> Self {
        Self {
            max_attempts: cfg.repair.max_attempts,
            max_actions_per_attempt: cfg.repair.max_actions_per_attempt,
            capabilities: cfg.repair.capabilities.clone(),
            repo_goal: cfg.repo_goal.clone(),
            original_summary: original_summary.to_string(),
            deny_paths: cfg.deny_paths.clone(),
            allow_workflow_edits: cfg.security.allow_workflow_edits,
            secret_scan: cfg.security.secret_scan,
        }
    }
}

/// A verification that ultimately passed.
#[derive(Debug)]
pub struct RepairOutcome {
    pub report: Report,
    pub attempts_used: u32,
}

/// Run verification, repairing failures until they pass, turn terminal, or
/// the attempt budget runs out.
pub fn verify_with_repair<V, P, C, G>(
    root: &Path,
    verifier: &V,
    planner: &P,
    runner: &C,
    gauge: &G,
    settings: &RepairSettings,
) -> Result<RepairOutcome>
where
    V: Verifier,
    P: PlanSource,
    C: CapabilityRunner,
    G: ChangeGauge,
{
    let mut attempts_used = 0u32;
    loop {
        let report = verifier.verify()?;
        let Some(failure) = report.first_failure().cloned() else {
            if attempts_used > 0 {
                info!(attempts_used, "verification passed after repair");
            }
            return Ok(RepairOutcome {
                report,
                attempts_used,
            });
        };

        let kind = failure.kind.unwrap_or(FailureKind::UnknownFailure);
        if kind.is_terminal() {
            return Err(verification_error(&failure))
                .context("terminal failure kind, repair is not attempted");
        }
        if attempts_used >= settings.max_attempts {
            return Err(verification_error(&failure)).with_context(|| {
                format!("verification still failing after {attempts_used} repair attempts")
            });
        }
        attempts_used += 1;

        info!(
            attempt = attempts_used,
            max_attempts = settings.max_attempts,
            kind = %kind,
            command = %failure.command,
            "starting repair attempt"
        );
        run_repair_attempt(root, planner, runner, gauge, settings, &report, &failure, kind)
            .with_context(|| format!("repair attempt {attempts_used} failed"))?;
    }
}

#[allow(clippy::too_many_arguments)]
fn run_repair_attempt<P, C, G>(
    root: &Path,
    planner: &P,
    runner: &C,
    gauge: &G,
    settings: &RepairSettings,
    report: &Report,
    failure: &CommandResult,
    kind: FailureKind,
) -> Result<()>
where
    P: PlanSource,
    C: CapabilityRunner,
    G: ChangeGauge,
{
    let allowed: Vec<&RepairCapability> = settings
        .capabilities
        .iter()
        .filter(|c| c.allows(kind.as_str()))
        .collect();

    let request = RepairRequest {
        repo_goal: settings.repo_goal.clone(),
        original_summary: settings.original_summary.clone(),
        failure_context: format_failure_context(report, failure),
        allowed_capabilities: allowed.iter().map(|c| c.id.clone()).collect(),
    };
    let mut plan = planner
        .generate_repair_plan(&request)
        .context("generate repair plan")?;
    plan.sanitize_for_repair(&settings.original_summary);

    if plan.files.is_empty() && plan.repair_actions.is_empty() {
        warn!("repair plan proposed nothing, re-verifying as-is");
        return Ok(());
    }

    if settings.secret_scan {
        plan::scan_for_secrets(&plan)?;
    }
    plan::validate_paths(&plan, &settings.deny_paths, settings.allow_workflow_edits)?;
    apply_plan(root, &plan)?;
    execute_repair_actions(runner, &allowed, &plan, settings.max_actions_per_attempt)?;
    gauge.check().context("change budget after repair")?;
    Ok(())
}

/// Execute the plan's capability actions in order, under per-attempt and
/// per-capability bounds.
fn execute_repair_actions(
    runner: &impl CapabilityRunner,
    allowed: &[&RepairCapability],
    plan: &Plan,
    max_actions: usize,
) -> Result<()> {
    if plan.repair_actions.len() > max_actions {
        return Err(anyhow!(
            "repair plan requests {} actions, limit is {max_actions}",
            plan.repair_actions.len()
        ));
    }

    let mut run_counts: HashMap<&str, u32> = HashMap::new();
    for id in &plan.repair_actions {
        let capability = allowed
            .iter()
            .find(|c| c.id == *id)
            .ok_or_else(|| anyhow!("repair action {id:?} is not allowed for this failure"))?;
        let count = run_counts.entry(capability.id.as_str()).or_insert(0);
        if *count >= capability.max_runs_per_attempt {
            return Err(anyhow!(
                "repair capability {id} exceeded max_runs_per_attempt ({})",
                capability.max_runs_per_attempt
            ));
        }
        *count += 1;
        runner
            .execute(capability)
            .with_context(|| format!("execute repair capability {id}"))?;
    }
    Ok(())
}

fn verification_error(failure: &CommandResult) -> anyhow::Error {
    anyhow::Error::new(CommandFailure {
        result: failure.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::capability::IntegrityViolation;
    use crate::test_support::{
        ScriptedCapabilityRunner, ScriptedGauge, ScriptedPlanSource, ScriptedVerifier,
        failed_result, passed_result, report_with,
    };

    fn settings(capabilities: Vec<RepairCapability>) -> RepairSettings {
        RepairSettings {
            max_attempts: 2,
            max_actions_per_attempt: 2,
            capabilities,
            repo_goal: "keep tests green".to_string(),
            original_summary: "improve docs".to_string(),
            deny_paths: vec![".git/".to_string()],
            allow_workflow_edits: false,
            secret_scan: true,
        }
    }

    fn capability(id: &str, kinds: &[&str]) -> RepairCapability {
        RepairCapability {
            id: id.to_string(),
            argv: vec!["true".to_string()],
            allowed_failure_kinds: kinds.iter().map(|s| s.to_string()).collect(),
            ..RepairCapability::default()
        }
    }

    fn action_plan(ids: &[&str]) -> Plan {
        Plan {
            summary: "repair".to_string(),
            repair_actions: ids.iter().map(|s| s.to_string()).collect(),
            ..Plan::default()
        }
    }

    fn pass_report() -> Report {
        report_with(vec![passed_result(1, 1, "go test ./...")])
    }

    fn fail_report(stdout: &str, stderr: &str) -> Report {
        report_with(vec![failed_result(1, 1, "go test ./...", stdout, stderr)])
    }

    #[test]
    fn passing_verification_skips_planner_entirely() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![pass_report()]);
        let planner = ScriptedPlanSource::default();
        let runner = ScriptedCapabilityRunner::default();
        let gauge = ScriptedGauge::default();

        let outcome = verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &runner,
            &gauge,
            &settings(vec![]),
        )
        .expect("outcome");
        assert_eq!(outcome.attempts_used, 0);
        assert_eq!(planner.repair_requests().len(), 0);
        assert!(runner.executed().is_empty());
    }

    #[test]
    fn terminal_kind_fails_without_calling_planner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![fail_report("", "checksum mismatch for sum.db")]);
        let planner = ScriptedPlanSource::default();
        let runner = ScriptedCapabilityRunner::default();
        let gauge = ScriptedGauge::default();

        let err = verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &runner,
            &gauge,
            &settings(vec![capability("go_mod_tidy", &[])]),
        )
        .unwrap_err();

        assert_eq!(planner.repair_requests().len(), 0);
        assert!(runner.executed().is_empty());
        let failure = err.downcast_ref::<CommandFailure>().expect("command failure");
        assert_eq!(failure.result.kind, Some(FailureKind::SecurityIntegrity));
        assert!(format!("{err:#}").contains("terminal failure kind"));
    }

    #[test]
    fn repair_then_pass_reports_attempts_used() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![
            fail_report("--- FAIL: TestFoo", ""),
            pass_report(),
        ]);
        let planner = ScriptedPlanSource::new(vec![action_plan(&["retry_tests"])]);
        let runner = ScriptedCapabilityRunner::default();
        let gauge = ScriptedGauge::default();

        let outcome = verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &runner,
            &gauge,
            &settings(vec![capability("retry_tests", &["test_failure"])]),
        )
        .expect("outcome");

        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(runner.executed(), vec!["retry_tests".to_string()]);
        assert_eq!(gauge.checks(), 1);
    }

    #[test]
    fn attempt_budget_exhaustion_propagates_original_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![
            fail_report("--- FAIL: TestFoo", ""),
            fail_report("--- FAIL: TestFoo", ""),
            fail_report("--- FAIL: TestFoo", ""),
        ]);
        let planner = ScriptedPlanSource::new(vec![
            action_plan(&["retry_tests"]),
            action_plan(&["retry_tests"]),
        ]);
        let runner = ScriptedCapabilityRunner::default();
        let gauge = ScriptedGauge::default();

        let err = verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &runner,
            &gauge,
            &settings(vec![capability("retry_tests", &["test_failure"])]),
        )
        .unwrap_err();

        assert_eq!(planner.repair_requests().len(), 2);
        assert_eq!(runner.executed().len(), 2);
        let failure = err.downcast_ref::<CommandFailure>().expect("command failure");
        assert_eq!(failure.result.command, "go test ./...");
        assert!(format!("{err:#}").contains("after 2 repair attempts"));
    }

    #[test]
    fn capabilities_are_filtered_by_failure_kind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![
            fail_report("--- FAIL: TestFoo", ""),
            pass_report(),
        ]);
        let planner = ScriptedPlanSource::new(vec![action_plan(&[])]);
        let runner = ScriptedCapabilityRunner::default();
        let gauge = ScriptedGauge::default();

        verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &runner,
            &gauge,
            &settings(vec![
                capability("retry_tests", &["test_failure"]),
                capability("go_mod_tidy", &["dependency_resolution"]),
                capability("anything", &[]),
            ]),
        )
        .expect("outcome");

        let requests = planner.repair_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].allowed_capabilities,
            vec!["retry_tests".to_string(), "anything".to_string()]
        );
        assert!(requests[0].failure_context.contains("go test ./..."));
    }

    #[test]
    fn unknown_action_id_rejects_the_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![fail_report("--- FAIL: TestFoo", "")]);
        let planner = ScriptedPlanSource::new(vec![action_plan(&["rm_rf_everything"])]);
        let runner = ScriptedCapabilityRunner::default();
        let gauge = ScriptedGauge::default();

        let err = verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &runner,
            &gauge,
            &settings(vec![capability("retry_tests", &["test_failure"])]),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("not allowed"));
        assert!(runner.executed().is_empty());
    }

    #[test]
    fn kind_mismatched_action_id_is_also_unknown() {
        // The capability exists but is filtered out for this failure kind, so
        // requesting it by id must fail the same way as a made-up id.
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![fail_report("--- FAIL: TestFoo", "")]);
        let planner = ScriptedPlanSource::new(vec![action_plan(&["go_mod_tidy"])]);
        let runner = ScriptedCapabilityRunner::default();
        let gauge = ScriptedGauge::default();

        let err = verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &runner,
            &gauge,
            &settings(vec![capability("go_mod_tidy", &["dependency_resolution"])]),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("not allowed"));
    }

    #[test]
    fn too_many_actions_are_rejected_before_any_runs() {
        let cap = capability("a", &[]);
        let allowed = vec![&cap];
        let runner = ScriptedCapabilityRunner::default();
        let err =
            execute_repair_actions(&runner, &allowed, &action_plan(&["a", "a", "a"]), 2).unwrap_err();
        assert!(err.to_string().contains("limit is 2"));
        assert!(runner.executed().is_empty());
    }

    #[test]
    fn per_capability_run_bound_is_enforced() {
        let cap = capability("a", &[]);
        let allowed = vec![&cap];
        let runner = ScriptedCapabilityRunner::default();
        let err =
            execute_repair_actions(&runner, &allowed, &action_plan(&["a", "a"]), 5).unwrap_err();
        assert!(err.to_string().contains("max_runs_per_attempt"));
        assert_eq!(runner.executed().len(), 1);
    }

    #[test]
    fn integrity_violation_from_capability_stays_downcastable() {
        struct FailingRunner;
        impl CapabilityRunner for FailingRunner {
            fn execute(&self, capability: &RepairCapability) -> Result<()> {
                Err(anyhow::Error::new(IntegrityViolation {
                    id: capability.id.clone(),
                }))
            }
        }

        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![fail_report("--- FAIL: TestFoo", "")]);
        let planner = ScriptedPlanSource::new(vec![action_plan(&["retry_tests"])]);
        let gauge = ScriptedGauge::default();

        let err = verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &FailingRunner,
            &gauge,
            &settings(vec![capability("retry_tests", &["test_failure"])]),
        )
        .unwrap_err();
        assert!(err.downcast_ref::<IntegrityViolation>().is_some());
    }

    #[test]
    fn empty_repair_plan_reverifies_without_mutating() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![
            fail_report("--- FAIL: TestFoo", ""),
            pass_report(),
        ]);
        let planner = ScriptedPlanSource::new(vec![Plan::default()]);
        let runner = ScriptedCapabilityRunner::default();
        let gauge = ScriptedGauge::default();

        let outcome = verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &runner,
            &gauge,
            &settings(vec![]),
        )
        .expect("outcome");
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(gauge.checks(), 0);
    }

    #[test]
    fn repair_plan_files_are_written_and_audit_fields_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![
            fail_report("--- FAIL: TestFoo", ""),
            pass_report(),
        ]);
        let plan = Plan {
            summary: String::new(),
            files: vec![crate::core::plan::PlanFile {
                path: "src/fix.rs".to_string(),
                mode: "write".to_string(),
                content: "// fixed".to_string(),
            }],
            changelog_entry: "should be dropped".to_string(),
            ..Plan::default()
        };
        let planner = ScriptedPlanSource::new(vec![plan]);
        let runner = ScriptedCapabilityRunner::default();
        let gauge = ScriptedGauge::default();

        verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &runner,
            &gauge,
            &settings(vec![]),
        )
        .expect("outcome");
        let body = std::fs::read_to_string(temp.path().join("src/fix.rs")).expect("read");
        assert_eq!(body, "// fixed");
    }

    #[test]
    fn repair_plan_touching_denied_path_fails_the_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ScriptedVerifier::new(vec![fail_report("--- FAIL: TestFoo", "")]);
        let plan = Plan {
            summary: "bad".to_string(),
            files: vec![crate::core::plan::PlanFile {
                path: ".git/hooks/pre-commit".to_string(),
                mode: "write".to_string(),
                content: "#!/bin/sh".to_string(),
            }],
            ..Plan::default()
        };
        let planner = ScriptedPlanSource::new(vec![plan]);
        let runner = ScriptedCapabilityRunner::default();
        let gauge = ScriptedGauge::default();

        let err = verify_with_repair(
            temp.path(),
            &verifier,
            &planner,
            &runner,
            &gauge,
            &settings(vec![]),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("denied"));
        assert!(!temp.path().join(".git/hooks/pre-commit").exists());
    }
}
