//! The decision engine.
//!
//! [`decide`] maps a snapshot of the world to exactly one [`Decision`]. It does
//! no I/O and never fails: every input, including statuses this build does not
//! recognise, has a defined action. Rules are evaluated in a fixed order and
//! the first rule that applies wins:
//!
//! 1. batch delegation while implementing ([`crate::core::batch`])
//! 2. budget and run-duration gates
//! 3. the active workflow (running, waiting, unresolved)
//! 4. step complete: complete, gate, merge wait or transition
//! 5. step failed or blocked: recovery or escalation
//! 6. step in progress without a workflow: spawn
//! 7. step not started: spawn, initializing batches on entry to implement
//! 8. anything else: logged as an error and escalated

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::core::batch::decide_batch;
use crate::core::staleness::{self, BATCH_STALE_THRESHOLD, WORKFLOW_STALE_THRESHOLD};
use crate::state::{
    BatchStatus, Execution, OrchestrationState, RecoveryTrigger, StepName, StepStatus, Workflow,
    WorkflowStatus,
};

/// Tunables the engine reads but never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionLimits {
    pub workflow_stale_threshold: Duration,
    pub batch_stale_threshold: Duration,
    pub max_run_duration: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive failed lookups of the referenced workflow before escalating.
    pub max_lookup_failures: u32,
}

impl Default for DecisionLimits {
    fn default() -> Self {
        Self {
            workflow_stale_threshold: WORKFLOW_STALE_THRESHOLD,
            batch_stale_threshold: BATCH_STALE_THRESHOLD,
            max_run_duration: Duration::from_secs(4 * 60 * 60),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_lookup_failures: 8,
        }
    }
}

impl DecisionLimits {
    /// `base * 2^failures`, capped at `backoff_max`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// What the loop knows about the workflow it is tracking.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowSnapshot {
    /// No workflow is referenced or active.
    None,
    Found(Workflow),
    /// The execution references a workflow id the source could not return.
    Unresolved { id: String },
}

impl WorkflowSnapshot {
    /// The workflow, when it still occupies the orchestration.
    pub fn active(&self) -> Option<&Workflow> {
        match self {
            WorkflowSnapshot::Found(workflow) if workflow.is_active() => Some(workflow),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, WorkflowSnapshot::Found(w) if w.status == WorkflowStatus::Running)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub state: &'a OrchestrationState,
    pub execution: &'a Execution,
    pub workflow: &'a WorkflowSnapshot,
    /// Latest observed activity; `None` when nothing was ever observed.
    pub last_activity: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub limits: &'a DecisionLimits,
}

/// The closed set of actions the executor knows how to carry out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Action {
    Wait,
    WaitWithBackoff {
        workflow_id: String,
        delay_ms: u64,
    },
    WaitUserGate,
    WaitMerge,
    Transition {
        next_step: StepName,
    },
    Complete,
    Spawn {
        step: StepName,
        skill: String,
        initialize_batches: bool,
    },
    SpawnBatch {
        batch_index: u32,
        section: String,
        task_ids: Vec<String>,
    },
    InitializeBatches,
    ForceStepComplete,
    AdvanceBatch {
        batch_index: u32,
    },
    Pause {
        batch_index: u32,
    },
    HealBatch {
        batch_index: u32,
        attempt: u32,
    },
    RecoverStale {
        workflow_id: String,
        stale_for_secs: u64,
    },
    RecoverFailed {
        step: StepName,
        batch_index: Option<u32>,
        attempts: u32,
        max_attempts: u32,
    },
    RecoverUnknown {
        detail: String,
    },
    NeedsAttention {
        trigger: RecoveryTrigger,
        issue: String,
    },
    Fail {
        trigger: RecoveryTrigger,
    },
}

impl Action {
    /// Stable snake_case name, as written to the decision log.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Wait => "wait",
            Action::WaitWithBackoff { .. } => "wait_with_backoff",
            Action::WaitUserGate => "wait_user_gate",
            Action::WaitMerge => "wait_merge",
            Action::Transition { .. } => "transition",
            Action::Complete => "complete",
            Action::Spawn { .. } => "spawn",
            Action::SpawnBatch { .. } => "spawn_batch",
            Action::InitializeBatches => "initialize_batches",
            Action::ForceStepComplete => "force_step_complete",
            Action::AdvanceBatch { .. } => "advance_batch",
            Action::Pause { .. } => "pause",
            Action::HealBatch { .. } => "heal_batch",
            Action::RecoverStale { .. } => "recover_stale",
            Action::RecoverFailed { .. } => "recover_failed",
            Action::RecoverUnknown { .. } => "recover_unknown",
            Action::NeedsAttention { .. } => "needs_attention",
            Action::Fail { .. } => "fail",
        }
    }

    /// True for actions that only suspend the loop.
    pub fn is_wait(&self) -> bool {
        matches!(
            self,
            Action::Wait | Action::WaitWithBackoff { .. } | Action::WaitUserGate | Action::WaitMerge
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    #[serde(flatten)]
    pub action: Action,
    pub reason: String,
}

impl Decision {
    pub fn new(action: Action, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
        }
    }
}

/// Decide the next action. Total and deterministic.
pub fn decide(input: &DecisionInput<'_>) -> Decision {
    if input.state.step.current == StepName::Implement
        && let Some(decision) = decide_batch(input)
    {
        return decision;
    }
    if let Some(decision) = check_gates(input) {
        return decision;
    }
    if let Some(decision) = check_workflow(input) {
        return decision;
    }
    decide_from_step(input)
}

fn check_gates(input: &DecisionInput<'_>) -> Option<Decision> {
    let execution = input.execution;
    let budget = execution.config.budget.max_total;
    if budget > 0.0 && execution.total_cost_usd >= budget {
        return Some(Decision::new(
            Action::Fail {
                trigger: RecoveryTrigger::ResourceExhaustion,
            },
            format!(
                "budget exhausted: spent ${:.2} of ${:.2}",
                execution.total_cost_usd, budget
            ),
        ));
    }

    let elapsed = staleness::stale_for(input.now, execution.started_at);
    if elapsed > input.limits.max_run_duration {
        return Some(Decision::new(
            Action::NeedsAttention {
                trigger: RecoveryTrigger::ResourceExhaustion,
                issue: "run duration exceeded".to_string(),
            },
            format!(
                "running for {}m, limit is {}m",
                elapsed.as_secs() / 60,
                input.limits.max_run_duration.as_secs() / 60
            ),
        ));
    }
    None
}

fn check_workflow(input: &DecisionInput<'_>) -> Option<Decision> {
    match input.workflow {
        WorkflowSnapshot::Found(workflow) => match workflow.status {
            WorkflowStatus::Running => Some(check_running(input, workflow)),
            WorkflowStatus::WaitingForInput => Some(Decision::new(
                Action::Wait,
                format!("workflow {} waiting for input", workflow.id),
            )),
            WorkflowStatus::Completed | WorkflowStatus::Failed => None,
        },
        WorkflowSnapshot::Unresolved { id } => Some(unresolved_workflow(input, id)),
        WorkflowSnapshot::None => None,
    }
}

fn check_running(input: &DecisionInput<'_>, workflow: &Workflow) -> Decision {
    let Some(last_activity) = input.last_activity else {
        return Decision::new(
            Action::Wait,
            format!("workflow {} running, no activity observed yet", workflow.id),
        );
    };
    let threshold = stale_threshold(input);
    let stale_for = staleness::stale_for(input.now, last_activity);
    if stale_for > threshold {
        return Decision::new(
            Action::RecoverStale {
                workflow_id: workflow.id.clone(),
                stale_for_secs: stale_for.as_secs(),
            },
            format!(
                "workflow {} idle for {}m (threshold {}m)",
                workflow.id,
                stale_for.as_secs() / 60,
                threshold.as_secs() / 60
            ),
        );
    }
    Decision::new(Action::Wait, format!("workflow {} running", workflow.id))
}

/// Batch workflows run longer between visible activity.
fn stale_threshold(input: &DecisionInput<'_>) -> Duration {
    let batch_running = input.state.step.current == StepName::Implement
        && input
            .execution
            .batches
            .active()
            .is_some_and(|batch| batch.status == BatchStatus::Running);
    if batch_running {
        input.limits.batch_stale_threshold
    } else {
        input.limits.workflow_stale_threshold
    }
}

fn unresolved_workflow(input: &DecisionInput<'_>, id: &str) -> Decision {
    let failures = input.execution.workflow_lookup_failures;
    if failures >= input.limits.max_lookup_failures {
        error!(
            workflow_id = id,
            failures, "referenced workflow never resolved, escalating"
        );
        return Decision::new(
            Action::RecoverUnknown {
                detail: format!("workflow {id} not found after {failures} lookups"),
            },
            format!("workflow {id} could not be resolved"),
        );
    }
    let delay = input.limits.backoff_delay(failures);
    Decision::new(
        Action::WaitWithBackoff {
            workflow_id: id.to_string(),
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        },
        format!("workflow {id} not found yet (lookup {})", failures + 1),
    )
}

fn decide_from_step(input: &DecisionInput<'_>) -> Decision {
    let step = &input.state.step;
    match step.status {
        Some(StepStatus::Complete) => step_complete(input),
        Some(StepStatus::Failed | StepStatus::Blocked) => step_failed(input),
        Some(StepStatus::InProgress) => Decision::new(
            spawn_for(step.current, false),
            format!("{} in progress without an active workflow", step.current.as_str()),
        ),
        Some(StepStatus::NotStarted) | None => {
            let initialize_batches =
                step.current == StepName::Implement && input.execution.batches.total == 0;
            Decision::new(
                spawn_for(step.current, initialize_batches),
                format!("starting {}", step.current.as_str()),
            )
        }
        Some(StepStatus::Unknown) => {
            error!(
                step = step.current.as_str(),
                "step status not recognised, no rule applies"
            );
            Decision::new(
                Action::RecoverUnknown {
                    detail: format!("unrecognised status for step {}", step.current.as_str()),
                },
                "no decision rule matched the current state",
            )
        }
    }
}

fn spawn_for(step: StepName, initialize_batches: bool) -> Action {
    Action::Spawn {
        step,
        skill: step.skill().to_string(),
        initialize_batches,
    }
}

fn step_complete(input: &DecisionInput<'_>) -> Decision {
    let current = input.state.step.current;
    let Some(next) = current.next() else {
        return Decision::new(Action::Complete, "all steps complete");
    };
    if next == StepName::Merge {
        if input.state.phase.gate_blocks() {
            return Decision::new(
                Action::WaitUserGate,
                format!("phase {} gate awaiting confirmation", input.state.phase.number),
            );
        }
        if !input.execution.config.auto_merge {
            return Decision::new(Action::WaitMerge, "verify complete, auto-merge disabled");
        }
    }
    Decision::new(
        Action::Transition { next_step: next },
        format!("{} complete", current.as_str()),
    )
}

fn step_failed(input: &DecisionInput<'_>) -> Decision {
    let step = input.state.step.current;
    let execution = input.execution;
    let max_attempts = execution.config.max_heal_attempts;
    if execution.heal_attempts >= max_attempts {
        return Decision::new(
            Action::NeedsAttention {
                trigger: RecoveryTrigger::StepFailure,
                issue: format!("{} failed", step.as_str()),
            },
            format!(
                "{} failed after {} of {} heal attempts",
                step.as_str(),
                execution.heal_attempts,
                max_attempts
            ),
        );
    }
    Decision::new(
        Action::RecoverFailed {
            step,
            batch_index: None,
            attempts: execution.heal_attempts,
            max_attempts,
        },
        format!("{} failed", step.as_str()),
    )
}
