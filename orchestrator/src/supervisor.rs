//! The control loop for one orchestration.
//!
//! Each iteration: read and validate the documents (repairing or recovering
//! them when needed), stop on a terminal status, resolve the tracked
//! workflow, decide, record the decision, execute it, persist what changed and
//! wait for a state change or a timeout.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::core::activity::{ActivitySignal, ActivitySource, last_activity};
use crate::core::decision::{Decision, DecisionInput, WorkflowSnapshot, decide};
use crate::core::settle::settle_finished_workflow;
use crate::core::validation::{repair, validate};
use crate::execute::{NextWait, escalate, execute, resume_recovered};
use crate::io::activity::ActivityLog;
use crate::io::config::LoopConfig;
use crate::io::init::OrchestratorPaths;
use crate::io::process::is_pid_alive;
use crate::io::runner_record::RunnerRecords;
use crate::io::state_store::StateStore;
use crate::io::workflow::{WorkflowLauncher, WorkflowSource};
use crate::recovery::{RecoveryAdapter, StateRecovery};
use crate::spawner::Spawner;
use crate::state::{
    DECISION_LOG_LIMIT, DecisionLogEntry, Execution, ExecutionConfig, ExecutionStatus,
    OrchestrationState, RecoveryTrigger,
};
use crate::wakeup::WakeupRegistry;

/// Everything the loop touches, passed in explicitly.
pub struct LoopDeps {
    pub orchestration_id: String,
    pub paths: OrchestratorPaths,
    pub config: LoopConfig,
    pub store: StateStore,
    pub workflows: Arc<dyn WorkflowSource>,
    pub launcher: Arc<dyn WorkflowLauncher>,
    pub spawner: Spawner,
    pub recovery: RecoveryAdapter,
    pub activity: ActivityLog,
    pub runners: RunnerRecords,
    pub clock: Arc<dyn Clock>,
    pub wakeups: Arc<WakeupRegistry>,
}

impl LoopDeps {
    pub fn new(
        orchestration_id: impl Into<String>,
        paths: OrchestratorPaths,
        config: LoopConfig,
        workflows: Arc<dyn WorkflowSource>,
        launcher: Arc<dyn WorkflowLauncher>,
        recovery: RecoveryAdapter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let orchestration_id = orchestration_id.into();
        let spawner = Spawner::new(
            &paths,
            orchestration_id.clone(),
            config.spawn_intent_ttl(),
            workflows.clone(),
            launcher.clone(),
            clock.clone(),
        );
        Self {
            store: StateStore::new(&paths),
            activity: ActivityLog::new(paths.activity_dir.clone()),
            runners: RunnerRecords::new(paths.runners_dir.clone()),
            wakeups: Arc::new(WakeupRegistry::new()),
            orchestration_id,
            paths,
            config,
            workflows,
            launcher,
            spawner,
            recovery,
            clock,
        }
    }
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    Completed,
    Cancelled,
    Failed { reason: Option<String> },
    NeedsAttention {
        trigger: RecoveryTrigger,
        issue: String,
    },
    /// The run exceeded the configured `max_iterations`.
    MaxIterationsReached { max_iterations: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub orchestration_id: String,
    pub iterations: u32,
    pub stop: LoopStop,
}

/// One decided and executed iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: u32,
    pub decision: Decision,
    pub wait: NextWait,
}

enum Loaded {
    Ready(OrchestrationState, Execution),
    /// The documents could not be recovered; the run needs a human.
    Escalated { issue: String },
}

/// Drive the orchestration until a terminal status or the iteration limit.
///
/// Fails only when the runner record cannot be claimed or a document write
/// fails; everything else is handled inside the loop.
#[instrument(skip_all, fields(orchestration_id = %deps.orchestration_id))]
pub fn run_loop<F: FnMut(&IterationReport)>(
    deps: &LoopDeps,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    for orphan in deps.runners.reconcile_orphans(is_pid_alive)? {
        warn!(
            orchestration_id = %orphan.orchestration_id,
            pid = orphan.pid,
            "cleared runner record left by a dead loop"
        );
    }
    let _runner = deps.runners.claim(
        &deps.orchestration_id,
        std::process::id(),
        deps.clock.now(),
        is_pid_alive,
    )?;
    info!("control loop started");

    let limits = deps.config.limits();
    let max_iterations = deps.config.max_iterations;
    let mut iterations = 0u32;
    loop {
        let (mut state, mut execution) = match load_documents(deps)? {
            Loaded::Ready(state, execution) => (state, execution),
            Loaded::Escalated { issue } => {
                return Ok(outcome(
                    deps,
                    iterations,
                    LoopStop::NeedsAttention {
                        trigger: RecoveryTrigger::Corruption,
                        issue,
                    },
                ));
            }
        };

        if let Some(stop) = terminal_stop(deps, &execution)? {
            return Ok(outcome(deps, iterations, stop));
        }
        if max_iterations > 0 && iterations >= max_iterations {
            return Ok(outcome(
                deps,
                iterations,
                LoopStop::MaxIterationsReached { max_iterations },
            ));
        }
        iterations += 1;

        if execution.status == ExecutionStatus::Paused {
            debug!("paused, waiting for resume");
            deps.wakeups
                .wait(&deps.orchestration_id, deps.config.poll_interval());
            continue;
        }

        let before_state = state.clone();
        let before_execution = execution.clone();
        let now = deps.clock.now();

        let snapshot = resolve_workflow(deps, &mut execution);
        if let Some(settled) = settle_finished_workflow(&mut state, &mut execution, &snapshot) {
            info!(settlement = ?settled, "workflow finished");
        }
        let snapshot = match snapshot {
            WorkflowSnapshot::Found(workflow) if !workflow.is_active() => WorkflowSnapshot::None,
            other => other,
        };

        let signals = deps
            .activity
            .read(&deps.orchestration_id)
            .unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "activity log unreadable");
                Vec::new()
            });
        let tracked = match &snapshot {
            WorkflowSnapshot::Found(workflow) => Some(workflow),
            _ => None,
        };
        let last_activity = last_activity(tracked, &signals, execution.workflow_spawned_at);

        let decision = decide(&DecisionInput {
            state: &state,
            execution: &execution,
            workflow: &snapshot,
            last_activity,
            now,
            limits: &limits,
        });
        info!(
            iteration = iterations,
            action = decision.action.name(),
            reason = %decision.reason,
            "decided"
        );
        execution.record_decision(
            DecisionLogEntry {
                timestamp: now,
                action: decision.action.name().to_string(),
                reason: decision.reason.clone(),
            },
            DECISION_LOG_LIMIT,
        );

        let wait = execute(deps, &decision, &mut state, &mut execution);
        execution.total_cost_usd += deps.recovery.take_spend();
        persist(deps, &before_state, &mut state, &before_execution, &execution, now)?;
        on_iteration(&IterationReport {
            iteration: iterations,
            decision,
            wait,
        });

        match wait {
            NextWait::Immediate => {}
            NextWait::Poll => {
                deps.wakeups
                    .wait(&deps.orchestration_id, deps.config.poll_interval());
            }
            NextWait::Delay(delay) => {
                deps.wakeups.wait(&deps.orchestration_id, delay);
            }
        }
    }
}

fn outcome(deps: &LoopDeps, iterations: u32, stop: LoopStop) -> LoopOutcome {
    info!(iterations, stop = ?stop, "control loop stopped");
    LoopOutcome {
        orchestration_id: deps.orchestration_id.clone(),
        iterations,
        stop,
    }
}

/// Stop reason for a terminal execution. Finished runs are archived.
fn terminal_stop(deps: &LoopDeps, execution: &Execution) -> Result<Option<LoopStop>> {
    let stop = match execution.status {
        ExecutionStatus::Completed => LoopStop::Completed,
        ExecutionStatus::Cancelled => LoopStop::Cancelled,
        ExecutionStatus::Failed => LoopStop::Failed {
            reason: execution.last_error.clone(),
        },
        ExecutionStatus::NeedsAttention => {
            let (trigger, issue) = execution.recovery_context.as_ref().map_or(
                (RecoveryTrigger::UnknownState, "needs attention".to_string()),
                |context| (context.trigger, context.issue.clone()),
            );
            LoopStop::NeedsAttention { trigger, issue }
        }
        ExecutionStatus::Running
        | ExecutionStatus::Paused
        | ExecutionStatus::WaitingMerge
        | ExecutionStatus::WaitingUserGate => return Ok(None),
    };
    if matches!(stop, LoopStop::Completed | LoopStop::Cancelled) {
        deps.store
            .archive(&deps.orchestration_id, deps.clock.now())?;
    }
    Ok(Some(stop))
}

fn load_documents(deps: &LoopDeps) -> Result<Loaded> {
    let now = deps.clock.now();
    let problem = match deps.store.read() {
        Ok((state, execution)) => {
            let issues = validate(&state, &execution);
            if issues.is_empty() {
                return Ok(Loaded::Ready(state, execution));
            }
            let repaired = repair(&state, &execution, &issues, now);
            if repaired.remaining.is_empty() {
                info!(issues = ?repaired.repaired, "repaired state inconsistencies");
                deps.store.write_state(&repaired.state)?;
                deps.store.write_execution(&repaired.execution)?;
                return Ok(Loaded::Ready(repaired.state, repaired.execution));
            }
            repaired
                .remaining
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        }
        Err(err) => {
            warn!(document = %err.document(), err = %err, "state unusable");
            err.to_string()
        }
    };
    recover_documents(deps, &problem)
}

/// Rebuild usable documents after corruption, or escalate.
///
/// An execution record that cannot be read is rebuilt from what survives of
/// it (config, start time, spend), so the run's limits keep applying.
fn recover_documents(deps: &LoopDeps, problem: &str) -> Result<Loaded> {
    let now = deps.clock.now();
    let id = deps.orchestration_id.as_str();
    let recovered = deps
        .recovery
        .recover_state(&deps.store, id, problem, now)
        .unwrap_or_else(|err| StateRecovery::Unresolved {
            reason: format!("{problem}; recovery aborted: {err:#}"),
        });
    let mut execution = match deps
        .store
        .read_execution()
        .ok()
        .filter(|execution| execution.orchestration_id == id)
    {
        Some(execution) => execution,
        None => match deps.store.salvage_execution(id) {
            Some(carried) => {
                info!(started_at = %carried.started_at, "execution record rebuilt from surviving settings");
                carried.into_execution(id)
            }
            None => {
                warn!("no execution settings survived, starting from defaults");
                Execution::new(id, ExecutionConfig::default(), now)
            }
        },
    };
    execution.total_cost_usd += deps.recovery.take_spend();

    match recovered {
        StateRecovery::Recovered(recovered) => {
            let mut state = deps
                .store
                .read_state()
                .ok()
                .filter(|state| state.orchestration_id == id)
                .unwrap_or_else(|| OrchestrationState::new(id));
            resume_recovered(&mut state, &mut execution, &recovered, now);
            deps.store.write_state(&state)?;
            deps.store.write_execution(&execution)?;
            let signal = ActivitySignal {
                source: ActivitySource::Recovery,
                session_id: None,
                at: now,
            };
            if let Err(err) = deps.activity.append(id, &signal) {
                warn!(err = %format!("{err:#}"), "failed to record activity");
            }
            info!(step = recovered.step.as_str(), source = ?recovered.source, "state recovered");
            Ok(Loaded::Ready(state, execution))
        }
        StateRecovery::Unresolved { reason } => {
            let issue = "orchestration state unusable".to_string();
            escalate(&mut execution, RecoveryTrigger::Corruption, &issue, &reason, now);
            deps.store.write_execution(&execution)?;
            Ok(Loaded::Escalated { issue })
        }
    }
}

/// Look up the tracked workflow, adopting an active one when none is tracked.
fn resolve_workflow(deps: &LoopDeps, execution: &mut Execution) -> WorkflowSnapshot {
    match execution.workflow_id.clone() {
        Some(id) => match deps.workflows.get(&id) {
            Ok(Some(workflow)) => {
                execution.workflow_lookup_failures = 0;
                WorkflowSnapshot::Found(workflow)
            }
            Ok(None) => WorkflowSnapshot::Unresolved { id },
            Err(err) => {
                warn!(workflow_id = %id, err = %format!("{err:#}"), "workflow lookup failed");
                WorkflowSnapshot::Unresolved { id }
            }
        },
        None => match deps.workflows.active_for(&deps.orchestration_id) {
            Ok(Some(workflow)) => {
                info!(workflow_id = %workflow.id, "adopting active workflow");
                execution.workflow_id = Some(workflow.id.clone());
                execution.workflow_spawned_at = workflow.started_at;
                WorkflowSnapshot::Found(workflow)
            }
            Ok(None) => WorkflowSnapshot::None,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "active workflow lookup failed");
                WorkflowSnapshot::None
            }
        },
    }
}

/// Write only the documents that changed.
fn persist(
    deps: &LoopDeps,
    before_state: &OrchestrationState,
    state: &mut OrchestrationState,
    before_execution: &Execution,
    execution: &Execution,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    if state != before_state {
        state.updated_at = Some(now);
        deps.store.write_state(state)?;
    }
    if execution != before_execution {
        deps.store.write_execution(execution)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision::Action;
    use crate::state::{StepName, StepStatus, WorkflowStatus};
    use crate::test_support::{Fakes, TestProject};

    #[test]
    fn loop_stops_on_needs_attention_without_deciding() {
        let project = TestProject::initialized("orch-1");
        let (state, mut execution) = project.read_documents();
        let now = execution.started_at;
        escalate(
            &mut execution,
            RecoveryTrigger::StepFailure,
            "verify failed",
            "exhausted",
            now,
        );
        project.write_documents(&state, &execution);
        let fakes = Fakes::new("orch-1");

        let mut decisions = Vec::new();
        let outcome = run_loop(&fakes.deps(&project), |report| {
            decisions.push(report.decision.clone())
        })
        .expect("loop");

        assert!(decisions.is_empty());
        assert_eq!(
            outcome.stop,
            LoopStop::NeedsAttention {
                trigger: RecoveryTrigger::StepFailure,
                issue: "verify failed".to_string()
            }
        );
        assert!(!project.paths().runners_dir.join("orch-1.json").exists());
    }

    #[test]
    fn first_iteration_spawns_design() {
        let project = TestProject::initialized("orch-1");
        let fakes = Fakes::new("orch-1").with_max_iterations(1);

        let mut actions = Vec::new();
        let outcome = run_loop(&fakes.deps(&project), |report| {
            actions.push(report.decision.action.clone())
        })
        .expect("loop");

        assert_eq!(
            outcome.stop,
            LoopStop::MaxIterationsReached { max_iterations: 1 }
        );
        assert!(matches!(
            actions.as_slice(),
            [Action::Spawn {
                step: StepName::Design,
                ..
            }]
        ));
        let (state, execution) = project.read_documents();
        assert_eq!(state.step.status, Some(StepStatus::InProgress));
        assert_eq!(execution.decision_log.len(), 1);
        assert_eq!(execution.decision_log[0].action, "spawn");
    }

    #[test]
    fn idle_iterations_leave_the_documents_untouched() {
        let project = TestProject::initialized("orch-1");
        let fakes = Fakes::new("orch-1").with_max_iterations(1);
        run_loop(&fakes.deps(&project), |_| {}).expect("first");
        let after_spawn = project.read_raw_execution();

        // The spawned workflow is still running: every further iteration waits.
        let fakes = fakes.with_max_iterations(3);
        let mut actions = Vec::new();
        run_loop(&fakes.deps(&project), |report| {
            actions.push(report.decision.action.clone())
        })
        .expect("loop");

        assert_eq!(actions.len(), 3);
        assert!(actions.iter().all(|action| *action == Action::Wait));
        let (_, execution) = project.read_documents();
        assert_eq!(execution.decision_log.len(), 2);
        assert_ne!(after_spawn, project.read_raw_execution());

        let before = project.read_raw_execution();
        run_loop(&fakes.deps(&project), |_| {}).expect("idle");
        assert_eq!(before, project.read_raw_execution());
    }

    #[test]
    fn finished_run_is_archived() {
        let project = TestProject::initialized("orch-1");
        let (mut state, execution) = project.read_documents();
        state.enter_step(StepName::Merge);
        state.step.status = Some(StepStatus::Complete);
        let mut execution = execution;
        execution.current_phase = StepName::Merge;
        project.write_documents(&state, &execution);
        let fakes = Fakes::new("orch-1");

        let outcome = run_loop(&fakes.deps(&project), |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::Completed);
        assert!(!project.paths().state_path.exists());
        let archived = std::fs::read_dir(&project.paths().archive_dir)
            .expect("archive")
            .count();
        assert_eq!(archived, 1);
    }

    #[test]
    fn repairable_drift_is_fixed_on_read() {
        let project = TestProject::initialized("orch-1");
        let (mut state, mut execution) = project.read_documents();
        state.step.index = 3;
        execution.current_phase = StepName::Verify;
        project.write_documents(&state, &execution);
        let fakes = Fakes::new("orch-1").with_max_iterations(1);

        run_loop(&fakes.deps(&project), |_| {}).expect("loop");

        let (state, execution) = project.read_documents();
        assert_eq!(state.step.index, 0);
        assert_eq!(execution.current_phase, StepName::Design);
    }

    #[test]
    fn corrupt_state_without_answers_or_artifacts_needs_attention() {
        let project = TestProject::initialized("orch-1");
        project.write_raw_state("{ not json");
        let fakes = Fakes::new("orch-1");

        let outcome = run_loop(&fakes.deps(&project), |_| {}).expect("loop");

        assert_eq!(
            outcome.stop,
            LoopStop::NeedsAttention {
                trigger: RecoveryTrigger::Corruption,
                issue: "orchestration state unusable".to_string()
            }
        );
        let execution = project.store().read_execution().expect("execution");
        assert_eq!(execution.status, ExecutionStatus::NeedsAttention);
        assert!(
            std::fs::read_dir(&project.paths().backups_dir)
                .expect("backups")
                .count()
                >= 1
        );
    }

    #[test]
    fn corrupt_state_recovers_from_artifacts() {
        let project = TestProject::initialized("orch-1");
        project.write_raw_state("{ not json");
        project.write_file("spec.md", "# Feature\n");
        project.write_file("plan.md", "# Plan\n");
        let fakes = Fakes::new("orch-1").with_max_iterations(1);

        let mut actions = Vec::new();
        run_loop(&fakes.deps(&project), |report| {
            actions.push(report.decision.action.clone())
        })
        .expect("loop");

        let (state, execution) = project.read_documents();
        assert_eq!(state.step.current, StepName::Analyze);
        assert!(
            execution
                .decision_log
                .iter()
                .any(|entry| entry.action == "recover_state")
        );
        assert!(matches!(
            actions.as_slice(),
            [Action::Spawn {
                step: StepName::Analyze,
                ..
            }]
        ));
    }

    #[test]
    fn unreadable_execution_keeps_its_settings_through_recovery() {
        let project = TestProject::initialized("orch-1");
        let (_, mut execution) = project.read_documents();
        execution.config.auto_merge = true;
        execution.config.budget.max_total = 7.0;
        execution.started_at = crate::test_support::fixed_now() - chrono::TimeDelta::hours(1);
        execution.total_cost_usd = 3.5;
        let mut raw = serde_json::to_value(&execution).expect("serialize");
        raw["status"] = serde_json::json!(7);
        std::fs::write(&project.paths().execution_path, raw.to_string()).expect("write");
        project.write_raw_state("{ not json");
        project.write_file("spec.md", "# Feature\n");
        project.write_file("plan.md", "# Plan\n");
        let fakes = Fakes::new("orch-1").with_max_iterations(1);

        run_loop(&fakes.deps(&project), |_| {}).expect("loop");

        let (state, recovered) = project.read_documents();
        assert_eq!(state.step.current, StepName::Analyze);
        assert!(recovered.config.auto_merge);
        assert_eq!(recovered.config.budget.max_total, 7.0);
        assert_eq!(recovered.started_at, execution.started_at);
        assert_eq!(recovered.total_cost_usd, 3.5);
    }

    #[test]
    fn settled_batch_advances() {
        let project = TestProject::initialized("orch-1");
        project.write_file("tasks.md", "## A\n- [ ] T001 a\n## B\n- [ ] T002 b\n");
        let (mut state, mut execution) = project.read_documents();
        state.enter_step(StepName::Implement);
        state.step.status = Some(StepStatus::InProgress);
        execution.current_phase = StepName::Implement;
        execution.batches = crate::core::tasks::batches_from_sections(
            &crate::core::tasks::parse_sections(&project.read_file("tasks.md")),
        );
        execution.batches.items[0].status = crate::state::BatchStatus::Running;
        execution.batches.items[0].workflow_id = Some("wf-1".to_string());
        execution.workflow_id = Some("wf-1".to_string());
        project.write_documents(&state, &execution);
        let fakes = Fakes::new("orch-1").with_max_iterations(1);
        fakes.workflows.insert(crate::test_support::workflow(
            "wf-1",
            "orch-1",
            WorkflowStatus::Completed,
        ));

        let mut actions = Vec::new();
        run_loop(&fakes.deps(&project), |report| {
            actions.push(report.decision.action.clone())
        })
        .expect("loop");

        assert_eq!(actions, vec![Action::AdvanceBatch { batch_index: 1 }]);
        let (_, execution) = project.read_documents();
        assert_eq!(execution.batches.current, 1);
        assert_eq!(
            execution.batches.items[0].status,
            crate::state::BatchStatus::Completed
        );
    }
}
