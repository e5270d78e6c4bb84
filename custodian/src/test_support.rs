//! Scripted collaborators and result builders shared across tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use anyhow::{Result, anyhow};

use crate::core::classifier;
use crate::core::plan::Plan;
use crate::core::report::{CommandResult, Report};
use crate::io::capability::CapabilityRunner;
use crate::io::config::RepairCapability;
use crate::io::git::{ChangeGauge, DiffTotals};
use crate::io::planner::{PlanRequest, PlanSource, RepairRequest};
use crate::io::verify::Verifier;

/// A passing command result.
pub fn passed_result(index: usize, total: usize, command: &str) -> CommandResult {
    CommandResult {
        index,
        total,
        command: command.to_string(),
        exit_code: 0,
        stdout: String::new(),
        stderr: String::new(),
        duration_ms: 1,
        passed: true,
        kind: None,
    }
}

/// A failing command result (exit 1), classified from its output the way the
/// verifier would.
pub fn failed_result(
    index: usize,
    total: usize,
    command: &str,
    stdout: &str,
    stderr: &str,
) -> CommandResult {
    let mut result = CommandResult {
        index,
        total,
        command: command.to_string(),
        exit_code: 1,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        duration_ms: 1,
        passed: false,
        kind: None,
    };
    result.kind = Some(classifier::classify(&result));
    result
}

pub fn report_with(commands: Vec<CommandResult>) -> Report {
    Report { commands }
}

/// Verifier that replays a fixed sequence of reports.
#[derive(Default)]
pub struct ScriptedVerifier {
    reports: RefCell<VecDeque<Report>>,
    calls: Cell<usize>,
}

impl ScriptedVerifier {
    pub fn new(reports: Vec<Report>) -> Self {
        Self {
            reports: RefCell::new(reports.into()),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self) -> Result<Report> {
        self.calls.set(self.calls.get() + 1);
        self.reports
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted verifier exhausted after {} calls", self.calls.get()))
    }
}

/// Plan source that replays scripted plans and records every request.
#[derive(Default)]
pub struct ScriptedPlanSource {
    plans: RefCell<VecDeque<Plan>>,
    plan_requests: RefCell<Vec<PlanRequest>>,
    repair_requests: RefCell<Vec<RepairRequest>>,
}

impl ScriptedPlanSource {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self {
            plans: RefCell::new(plans.into()),
            ..Self::default()
        }
    }

    pub fn plan_requests(&self) -> Vec<PlanRequest> {
        self.plan_requests.borrow().clone()
    }

    pub fn repair_requests(&self) -> Vec<RepairRequest> {
        self.repair_requests.borrow().clone()
    }

    fn next_plan(&self) -> Result<Plan> {
        self.plans
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted plan source exhausted"))
    }
}

impl PlanSource for ScriptedPlanSource {
    fn generate_plan(&self, request: &PlanRequest) -> Result<Plan> {
        self.plan_requests.borrow_mut().push(request.clone());
        self.next_plan()
    }

    fn generate_repair_plan(&self, request: &RepairRequest) -> Result<Plan> {
        self.repair_requests.borrow_mut().push(request.clone());
        self.next_plan()
    }
}

/// Capability runner that records executed ids and always succeeds.
#[derive(Default)]
pub struct ScriptedCapabilityRunner {
    executed: RefCell<Vec<String>>,
}

impl ScriptedCapabilityRunner {
    pub fn executed(&self) -> Vec<String> {
        self.executed.borrow().clone()
    }
}

impl CapabilityRunner for ScriptedCapabilityRunner {
    fn execute(&self, capability: &RepairCapability) -> Result<()> {
        self.executed.borrow_mut().push(capability.id.clone());
        Ok(())
    }
}

/// Change gauge that counts checks and returns fixed totals.
#[derive(Default)]
pub struct ScriptedGauge {
    checks: Cell<usize>,
    totals: Cell<DiffTotals>,
    fail: Cell<bool>,
}

impl ScriptedGauge {
    pub fn with_totals(totals: DiffTotals) -> Self {
        let gauge = Self::default();
        gauge.totals.set(totals);
        gauge
    }

    pub fn failing() -> Self {
        let gauge = Self::default();
        gauge.fail.set(true);
        gauge
    }

    pub fn checks(&self) -> usize {
        self.checks.get()
    }
}

impl ChangeGauge for ScriptedGauge {
    fn check(&self) -> Result<DiffTotals> {
        self.checks.set(self.checks.get() + 1);
        if self.fail.get() {
            return Err(anyhow!("budget exceeded: scripted gauge"));
        }
        Ok(self.totals.get())
    }
}
