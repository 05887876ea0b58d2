//! Carries out one decision.
//!
//! [`execute`] mutates the in-memory documents and performs the side effects
//! the action calls for. It never fails: launch, cancel and oracle errors are
//! logged and turned into their fallback (a failed step or batch, or
//! `needs_attention`). The caller persists whatever changed.

use std::fs;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::core::activity::{ActivitySignal, ActivitySource};
use crate::core::decision::{Action, Decision};
use crate::core::tasks::{batches_from_sections, parse_sections};
use crate::core::validation::{repair, validate};
use crate::io::prompt::BatchContext;
use crate::recovery::{
    FailedContext, FailedResolution, RecoveredStep, StaleContext, StaleResolution, StateRecovery,
};
use crate::spawner::SpawnOutcome;
use crate::state::{
    Batch, BatchStatus, Batches, DECISION_LOG_LIMIT, DecisionLogEntry, Execution,
    ExecutionStatus, OrchestrationState, RecoveryContext, RecoveryTrigger, Step, StepName,
    StepStatus,
};
use crate::supervisor::LoopDeps;

/// Skill used for batch heal workflows.
pub const HEAL_SKILL: &str = "heal";

/// How long the loop should wait after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextWait {
    /// Decide again right away; the action changed the documents.
    Immediate,
    /// Wait for a state change or the poll interval.
    Poll,
    Delay(Duration),
}

enum Launch {
    Started,
    /// Someone else holds the orchestration; nothing was launched.
    Held,
    Failed(String),
}

pub fn execute(
    deps: &LoopDeps,
    decision: &Decision,
    state: &mut OrchestrationState,
    execution: &mut Execution,
) -> NextWait {
    let now = deps.clock.now();
    if !decision.action.is_wait()
        && matches!(
            execution.status,
            ExecutionStatus::WaitingMerge | ExecutionStatus::WaitingUserGate
        )
    {
        execution.status = ExecutionStatus::Running;
    }

    match &decision.action {
        Action::Wait => NextWait::Poll,
        Action::WaitWithBackoff { delay_ms, .. } => {
            execution.workflow_lookup_failures += 1;
            NextWait::Delay(Duration::from_millis(*delay_ms))
        }
        Action::WaitUserGate => {
            execution.status = ExecutionStatus::WaitingUserGate;
            NextWait::Poll
        }
        Action::WaitMerge => {
            execution.status = ExecutionStatus::WaitingMerge;
            NextWait::Poll
        }
        Action::Transition { next_step } => {
            info!(from = state.step.current.as_str(), to = next_step.as_str(), "step transition");
            state.enter_step(*next_step);
            execution.current_phase = *next_step;
            execution.heal_attempts = 0;
            execution.last_error = None;
            execution.clear_workflow();
            NextWait::Immediate
        }
        Action::Complete => {
            info!("orchestration complete");
            execution.status = ExecutionStatus::Completed;
            execution.clear_workflow();
            NextWait::Immediate
        }
        Action::Spawn {
            step,
            skill,
            initialize_batches,
        } => {
            if *initialize_batches {
                initialize_batches_from_tasks(deps, execution, now);
                if execution.status == ExecutionStatus::NeedsAttention {
                    return NextWait::Immediate;
                }
            }
            match launch(deps, skill, None, execution, now) {
                Launch::Started => {
                    state.step.status = Some(StepStatus::InProgress);
                    NextWait::Poll
                }
                Launch::Held => NextWait::Poll,
                Launch::Failed(detail) => {
                    warn!(step = step.as_str(), "step workflow failed to launch");
                    state.step.status = Some(StepStatus::Failed);
                    execution.last_error = Some(detail);
                    NextWait::Immediate
                }
            }
        }
        Action::SpawnBatch { batch_index, .. } => {
            let Some(context) = batch_prompt(execution, *batch_index, None) else {
                return batch_missing(execution, *batch_index, now);
            };
            match launch(deps, StepName::Implement.skill(), Some(&context), execution, now) {
                Launch::Started => {
                    let workflow_id = execution.workflow_id.clone();
                    if let Some(batch) = execution.batches.items.get_mut(*batch_index as usize) {
                        batch.status = BatchStatus::Running;
                        batch.workflow_id = workflow_id;
                    }
                    state.step.status = Some(StepStatus::InProgress);
                    NextWait::Poll
                }
                Launch::Held => NextWait::Poll,
                Launch::Failed(detail) => {
                    if let Some(batch) = execution.batches.items.get_mut(*batch_index as usize) {
                        batch.status = BatchStatus::Failed;
                    }
                    execution.last_error = Some(detail);
                    NextWait::Immediate
                }
            }
        }
        Action::InitializeBatches => {
            initialize_batches_from_tasks(deps, execution, now);
            NextWait::Immediate
        }
        Action::ForceStepComplete => {
            state.step.status = Some(StepStatus::Complete);
            NextWait::Immediate
        }
        Action::AdvanceBatch { batch_index } => {
            execution.batches.current = *batch_index;
            execution.clear_workflow();
            NextWait::Immediate
        }
        Action::Pause { batch_index } => {
            info!(next_batch = batch_index + 1, "pausing between batches");
            execution.batches.current = *batch_index;
            execution.status = ExecutionStatus::Paused;
            execution.clear_workflow();
            NextWait::Poll
        }
        Action::HealBatch {
            batch_index,
            attempt,
        } => {
            let last_error = execution.last_error.clone();
            let Some(context) = batch_prompt(execution, *batch_index, last_error.as_deref())
            else {
                return batch_missing(execution, *batch_index, now);
            };
            let launched = launch(deps, HEAL_SKILL, Some(&context), execution, now);
            let workflow_id = execution.workflow_id.clone();
            let Some(batch) = execution.batches.items.get_mut(*batch_index as usize) else {
                return NextWait::Immediate;
            };
            match launched {
                Launch::Started => {
                    batch.heal_attempts = *attempt;
                    batch.status = BatchStatus::Running;
                    batch.workflow_id = workflow_id;
                    NextWait::Poll
                }
                Launch::Held => NextWait::Poll,
                Launch::Failed(detail) => {
                    batch.heal_attempts = *attempt;
                    execution.last_error = Some(detail);
                    NextWait::Immediate
                }
            }
        }
        Action::RecoverStale {
            workflow_id,
            stale_for_secs,
        } => recover_stale(deps, state, execution, workflow_id, *stale_for_secs, now),
        Action::RecoverFailed {
            step,
            batch_index,
            attempts,
            max_attempts,
        } => {
            let context = FailedContext {
                orchestration_id: &state.orchestration_id,
                step: *step,
                batch: batch_index.and_then(|index| batch_context(execution, index)),
                attempts: *attempts,
                max_attempts: *max_attempts,
                last_error: execution.last_error.as_deref(),
            };
            let resolution = deps.recovery.diagnose_failed(&context);
            record_activity(deps, ActivitySource::Recovery, None, now);
            apply_failed_resolution(deps, state, execution, *batch_index, resolution, now)
        }
        Action::RecoverUnknown { detail } => {
            let recovered = deps
                .recovery
                .recover_state(&deps.store, &deps.orchestration_id, detail, now)
                .unwrap_or_else(|err| StateRecovery::Unresolved {
                    reason: format!("{detail}; recovery aborted: {err:#}"),
                });
            record_activity(deps, ActivitySource::Recovery, None, now);
            match recovered {
                StateRecovery::Recovered(recovered) => {
                    info!(step = recovered.step.as_str(), source = ?recovered.source, "unknown state resolved");
                    resume_recovered(state, execution, &recovered, now);
                }
                StateRecovery::Unresolved { reason } => {
                    escalate(execution, RecoveryTrigger::UnknownState, detail, &reason, now);
                }
            }
            NextWait::Immediate
        }
        Action::NeedsAttention { trigger, issue } => {
            escalate(execution, *trigger, issue, &decision.reason, now);
            NextWait::Immediate
        }
        Action::Fail { trigger } => {
            error!(trigger = ?trigger, reason = %decision.reason, "orchestration failed");
            execution.status = ExecutionStatus::Failed;
            execution.last_error = Some(decision.reason.clone());
            execution.clear_workflow();
            NextWait::Immediate
        }
    }
}

/// Point the documents at a recovered step and log where the answer came from.
///
/// The tracked workflow is dropped, and batches that no longer fit the step
/// are reset before the remaining drift is repaired.
pub fn resume_recovered(
    state: &mut OrchestrationState,
    execution: &mut Execution,
    recovered: &RecoveredStep,
    now: DateTime<Utc>,
) {
    state.step = Step::new(recovered.step, recovered.status);
    state.updated_at = Some(now);
    execution.current_phase = recovered.step;
    execution.clear_workflow();
    if !validate(state, execution).is_empty() {
        execution.batches = Batches::default();
    }
    let issues = validate(state, execution);
    if !issues.is_empty() {
        let repaired = repair(state, execution, &issues, now);
        *state = repaired.state;
        *execution = repaired.execution;
    }
    execution.record_decision(
        DecisionLogEntry {
            timestamp: now,
            action: "recover_state".to_string(),
            reason: format!(
                "resumed at {} ({:?}, confidence {:.2}): {}",
                recovered.step.as_str(),
                recovered.source,
                recovered.confidence,
                recovered.reason
            ),
        },
        DECISION_LOG_LIMIT,
    );
}

/// Put the run into `needs_attention` with a user-facing explanation.
pub fn escalate(
    execution: &mut Execution,
    trigger: RecoveryTrigger,
    issue: &str,
    reason: &str,
    now: DateTime<Utc>,
) {
    warn!(trigger = ?trigger, issue, reason, "needs attention");
    let attempts = execution
        .batches
        .active()
        .filter(|batch| batch.status == BatchStatus::Failed)
        .map_or(execution.heal_attempts, |batch| batch.heal_attempts);
    execution.mark_needs_attention(RecoveryContext {
        issue: issue.to_string(),
        reason: reason.to_string(),
        trigger,
        attempts,
        suggested_action: Some(suggested_action(trigger).to_string()),
        recorded_at: now,
    });
}

fn suggested_action(trigger: RecoveryTrigger) -> &'static str {
    match trigger {
        RecoveryTrigger::Corruption => {
            "restore the state from .orchestrator/backups or re-run init with --force"
        }
        RecoveryTrigger::Staleness => "check the worker log, then set the status back to running",
        RecoveryTrigger::StepFailure => {
            "fix the failure, reset the step status and set the status back to running"
        }
        RecoveryTrigger::ResourceExhaustion => "raise the limit or archive the run",
        RecoveryTrigger::UnknownState => "correct the orchestration state by hand",
        RecoveryTrigger::BatchSetup => "add checklist tasks (- [ ] T001 ...) to the task list",
    }
}

fn launch(
    deps: &LoopDeps,
    skill: &str,
    context: Option<&str>,
    execution: &mut Execution,
    now: DateTime<Utc>,
) -> Launch {
    match deps.spawner.spawn_with_intent(skill, context) {
        Ok(SpawnOutcome::Spawned(handle)) => {
            execution.workflow_id = Some(handle.id.clone());
            execution.workflow_spawned_at = Some(now);
            execution.workflow_lookup_failures = 0;
            record_activity(deps, ActivitySource::Loop, handle.session_id, now);
            Launch::Started
        }
        Ok(SpawnOutcome::Skipped(reason)) => {
            info!(skill, reason = ?reason, "spawn skipped");
            Launch::Held
        }
        Ok(SpawnOutcome::AlreadyRunning { workflow_id }) => {
            if execution.workflow_id.is_none() {
                execution.workflow_id = Some(workflow_id);
                execution.workflow_spawned_at = Some(now);
            }
            Launch::Held
        }
        Err(err) => {
            let detail = format!("{err:#}");
            warn!(skill, err = %detail, "spawn failed");
            Launch::Failed(detail)
        }
    }
}

fn record_activity(
    deps: &LoopDeps,
    source: ActivitySource,
    session_id: Option<String>,
    now: DateTime<Utc>,
) {
    let signal = ActivitySignal {
        source,
        session_id,
        at: now,
    };
    if let Err(err) = deps.activity.append(&deps.orchestration_id, &signal) {
        warn!(err = %format!("{err:#}"), "failed to record activity");
    }
}

fn initialize_batches_from_tasks(deps: &LoopDeps, execution: &mut Execution, now: DateTime<Utc>) {
    let tasks_path = deps.paths.resolve(&deps.config.tasks_file);
    let contents = match fs::read_to_string(&tasks_path) {
        Ok(contents) => contents,
        Err(err) => {
            escalate(
                execution,
                RecoveryTrigger::BatchSetup,
                "task list unreadable",
                &format!("read {}: {err}", tasks_path.display()),
                now,
            );
            return;
        }
    };
    let sections = parse_sections(&contents);
    if sections.is_empty() {
        escalate(
            execution,
            RecoveryTrigger::BatchSetup,
            "no tasks to batch",
            &format!("{} contains no checklist tasks", tasks_path.display()),
            now,
        );
        return;
    }
    execution.batches = batches_from_sections(&sections);
    info!(batches = execution.batches.total, "batches initialized");
}

fn batch_context(execution: &Execution, index: u32) -> Option<BatchContext> {
    let batch = execution.batches.items.get(index as usize)?;
    Some(BatchContext {
        position: batch.index + 1,
        total: execution.batches.total,
        section: batch.section.clone(),
        task_ids: batch.task_ids.clone(),
    })
}

/// Worker context for a batch: which section and which tasks.
fn batch_prompt(execution: &Execution, index: u32, last_error: Option<&str>) -> Option<String> {
    let batch: &Batch = execution.batches.items.get(index as usize)?;
    let mut prompt = format!(
        "Batch {} of {}: {}\nTasks: {}",
        batch.index + 1,
        execution.batches.total,
        batch.section,
        batch.task_ids.join(", ")
    );
    if let Some(last_error) = last_error {
        prompt.push_str("\nPrevious attempt failed: ");
        prompt.push_str(last_error);
    }
    Some(prompt)
}

fn batch_missing(execution: &mut Execution, index: u32, now: DateTime<Utc>) -> NextWait {
    escalate(
        execution,
        RecoveryTrigger::UnknownState,
        "batch missing",
        &format!("batch index {index} is out of range"),
        now,
    );
    NextWait::Immediate
}

fn recover_stale(
    deps: &LoopDeps,
    state: &mut OrchestrationState,
    execution: &mut Execution,
    workflow_id: &str,
    stale_for_secs: u64,
    now: DateTime<Utc>,
) -> NextWait {
    let transcript = deps
        .workflows
        .transcript_excerpt(workflow_id, deps.config.oracle.transcript_excerpt_bytes)
        .unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "transcript unavailable");
            None
        });
    let running_batch = running_batch_index(state, execution);
    let context = StaleContext {
        orchestration_id: &state.orchestration_id,
        step: state.step.current,
        batch: running_batch.and_then(|index| batch_context(execution, index)),
        workflow_id,
        stale_for: Duration::from_secs(stale_for_secs),
        transcript: transcript.as_deref(),
    };
    let resolution = deps.recovery.diagnose_stale(&context);
    record_activity(deps, ActivitySource::Recovery, None, now);

    match resolution {
        StaleResolution::Continue { reason } => {
            info!(reason = %reason, "stale workflow left running");
            NextWait::Poll
        }
        StaleResolution::RestartTask { reason } => {
            info!(reason = %reason, "restarting stale work");
            cancel(deps, workflow_id);
            match running_batch.and_then(|index| execution.batches.items.get_mut(index as usize)) {
                Some(batch) => {
                    batch.status = BatchStatus::Pending;
                    batch.workflow_id = None;
                }
                None => state.step.status = Some(StepStatus::InProgress),
            }
            execution.clear_workflow();
            NextWait::Immediate
        }
        StaleResolution::SkipTask { reason } => {
            info!(reason = %reason, "skipping stale work");
            cancel(deps, workflow_id);
            match running_batch.and_then(|index| execution.batches.items.get_mut(index as usize)) {
                Some(batch) => batch.status = BatchStatus::Completed,
                None => state.step.status = Some(StepStatus::Complete),
            }
            execution.clear_workflow();
            NextWait::Immediate
        }
        StaleResolution::Abort { reason } => {
            cancel(deps, workflow_id);
            execution.clear_workflow();
            escalate(
                execution,
                RecoveryTrigger::Staleness,
                &format!("workflow {workflow_id} aborted"),
                &reason,
                now,
            );
            NextWait::Immediate
        }
        StaleResolution::Escalate { reason } => {
            escalate(
                execution,
                RecoveryTrigger::Staleness,
                &format!("workflow {workflow_id} stale"),
                &reason,
                now,
            );
            NextWait::Immediate
        }
    }
}

fn running_batch_index(state: &OrchestrationState, execution: &Execution) -> Option<u32> {
    if state.step.current != StepName::Implement {
        return None;
    }
    execution
        .batches
        .active()
        .filter(|batch| batch.status == BatchStatus::Running)
        .map(|batch| batch.index)
}

fn cancel(deps: &LoopDeps, workflow_id: &str) {
    if let Err(err) = deps.launcher.cancel(workflow_id) {
        warn!(workflow_id, err = %format!("{err:#}"), "failed to cancel workflow");
    }
}

fn bump_attempts(execution: &mut Execution, batch_index: Option<u32>) {
    match batch_index.and_then(|index| execution.batches.items.get_mut(index as usize)) {
        Some(batch) => batch.heal_attempts += 1,
        None => execution.heal_attempts += 1,
    }
}

fn apply_failed_resolution(
    deps: &LoopDeps,
    state: &mut OrchestrationState,
    execution: &mut Execution,
    batch_index: Option<u32>,
    resolution: FailedResolution,
    now: DateTime<Utc>,
) -> NextWait {
    let step = state.step.current;
    match resolution {
        FailedResolution::Retry { reason } => {
            info!(reason = %reason, "retrying failed work");
            bump_attempts(execution, batch_index);
            reopen(state, execution, batch_index, BatchStatus::Pending);
            NextWait::Immediate
        }
        FailedResolution::SkipTasks { task_ids, reason } => {
            info!(tasks = ?task_ids, reason = %reason, "skipping failed tasks");
            bump_attempts(execution, batch_index);
            match batch_index.and_then(|index| execution.batches.items.get_mut(index as usize)) {
                Some(batch) => batch.status = BatchStatus::Completed,
                None => state.step.status = Some(StepStatus::Complete),
            }
            NextWait::Immediate
        }
        FailedResolution::RunPrerequisite { skill, reason } => {
            info!(prerequisite = %skill, reason = %reason, "running prerequisite");
            bump_attempts(execution, batch_index);
            let context = format!("Prerequisite for {}: {reason}", step.as_str());
            match launch(deps, &skill, Some(&context), execution, now) {
                Launch::Started => {
                    reopen(state, execution, batch_index, BatchStatus::Pending);
                    NextWait::Poll
                }
                Launch::Held => NextWait::Poll,
                Launch::Failed(detail) => {
                    escalate(
                        execution,
                        RecoveryTrigger::StepFailure,
                        &format!("prerequisite {skill} failed to launch"),
                        &detail,
                        now,
                    );
                    NextWait::Immediate
                }
            }
        }
        FailedResolution::Abort { reason } => {
            escalate(
                execution,
                RecoveryTrigger::StepFailure,
                &format!("{} aborted", step.as_str()),
                &reason,
                now,
            );
            NextWait::Immediate
        }
        FailedResolution::Escalate { reason } => {
            escalate(
                execution,
                RecoveryTrigger::StepFailure,
                &format!("{} failed", step.as_str()),
                &reason,
                now,
            );
            NextWait::Immediate
        }
    }
}

/// Make failed work runnable again.
fn reopen(
    state: &mut OrchestrationState,
    execution: &mut Execution,
    batch_index: Option<u32>,
    batch_status: BatchStatus,
) {
    if let Some(batch) = batch_index.and_then(|index| execution.batches.items.get_mut(index as usize))
    {
        batch.status = batch_status;
        batch.workflow_id = None;
    }
    if matches!(
        state.step.status,
        Some(StepStatus::Failed | StepStatus::Blocked)
    ) || batch_index.is_none()
    {
        state.step.status = Some(StepStatus::InProgress);
    }
}
