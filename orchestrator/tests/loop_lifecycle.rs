//! Loop-level tests for full orchestration scenarios.
//!
//! These drive `run_loop` against in-memory workers and a scripted oracle
//! and check what ends up in the documents.

use chrono::TimeDelta;
use serde_json::json;

use orchestrator::core::decision::Action;
use orchestrator::state::{
    Batch, BatchStatus, Batches, ExecutionStatus, RecoveryTrigger, StepName, StepStatus,
    Workflow, WorkflowStatus,
};
use orchestrator::supervisor::{LoopStop, run_loop};
use orchestrator::test_support::{Fakes, TestProject, fixed_now, workflow};

fn actions_of(fakes: &Fakes, project: &TestProject) -> (Vec<Action>, LoopStop) {
    let mut actions = Vec::new();
    let outcome = run_loop(&fakes.deps(project), |report| {
        actions.push(report.decision.action.clone())
    })
    .expect("loop");
    (actions, outcome.stop)
}

fn at_step(project: &TestProject, step: StepName, status: StepStatus, auto_merge: bool) {
    let (mut state, mut execution) = project.read_documents();
    state.enter_step(step);
    state.step.status = Some(status);
    execution.current_phase = step;
    execution.config.auto_merge = auto_merge;
    project.write_documents(&state, &execution);
}

/// Complete whatever the loop just launched, the way a worker would.
fn finish_launched_work(project: &TestProject, fakes: &Fakes, action: &Action) {
    let (mut state, execution) = project.read_documents();
    let Some(workflow_id) = execution.workflow_id.clone() else {
        return;
    };
    match action {
        Action::Spawn { .. } => {
            state.step.status = Some(StepStatus::Complete);
            project.write_documents(&state, &execution);
        }
        Action::SpawnBatch { .. } | Action::HealBatch { .. } => {}
        _ => return,
    }
    fakes
        .workflows
        .set_status(&workflow_id, WorkflowStatus::Completed);
}

#[test]
fn verify_complete_with_auto_merge_transitions_to_merge() {
    let project = TestProject::initialized("orch-1");
    at_step(&project, StepName::Verify, StepStatus::Complete, true);
    let fakes = Fakes::new("orch-1").with_max_iterations(1);

    let (actions, _) = actions_of(&fakes, &project);

    assert_eq!(
        actions,
        vec![Action::Transition {
            next_step: StepName::Merge
        }]
    );
    let (state, execution) = project.read_documents();
    assert_eq!(state.step.current, StepName::Merge);
    assert_eq!(state.step.status, Some(StepStatus::NotStarted));
    assert_eq!(execution.current_phase, StepName::Merge);
}

#[test]
fn verify_complete_without_auto_merge_waits_for_merge() {
    let project = TestProject::initialized("orch-1");
    at_step(&project, StepName::Verify, StepStatus::Complete, false);
    let fakes = Fakes::new("orch-1").with_max_iterations(2);

    let (actions, stop) = actions_of(&fakes, &project);

    assert_eq!(actions, vec![Action::WaitMerge, Action::WaitMerge]);
    assert_eq!(stop, LoopStop::MaxIterationsReached { max_iterations: 2 });
    let (state, execution) = project.read_documents();
    assert_eq!(state.step.current, StepName::Verify);
    assert_eq!(execution.status, ExecutionStatus::WaitingMerge);
    assert_eq!(execution.decision_log.len(), 1);
}

#[test]
fn completed_batch_advances_to_the_next() {
    let project = TestProject::initialized("orch-1");
    at_step(&project, StepName::Implement, StepStatus::InProgress, false);
    let (state, mut execution) = project.read_documents();
    let statuses = [BatchStatus::Completed, BatchStatus::Pending, BatchStatus::Pending];
    execution.batches = Batches {
        total: 3,
        current: 0,
        items: statuses
            .iter()
            .enumerate()
            .map(|(index, status)| Batch {
                index: index as u32,
                section: format!("Section {index}"),
                task_ids: vec![format!("T00{index}")],
                status: *status,
                workflow_id: None,
                heal_attempts: 0,
            })
            .collect(),
    };
    project.write_documents(&state, &execution);
    let fakes = Fakes::new("orch-1").with_max_iterations(1);

    let (actions, _) = actions_of(&fakes, &project);

    assert_eq!(actions, vec![Action::AdvanceBatch { batch_index: 1 }]);
    assert_eq!(project.read_documents().1.batches.current, 1);
}

#[test]
fn silent_workflow_is_recovered_as_stale() {
    let project = TestProject::initialized("orch-1");
    at_step(&project, StepName::Design, StepStatus::InProgress, false);
    let (state, mut execution) = project.read_documents();
    execution.workflow_id = Some("wf-1".to_string());
    execution.workflow_spawned_at = Some(fixed_now() - TimeDelta::minutes(30));
    project.write_documents(&state, &execution);
    let fakes = Fakes::new("orch-1");
    fakes.workflows.insert(Workflow {
        last_activity_at: Some(fixed_now() - TimeDelta::minutes(11)),
        started_at: Some(fixed_now() - TimeDelta::minutes(30)),
        ..workflow("wf-1", "orch-1", WorkflowStatus::Running)
    });

    let (actions, stop) = actions_of(&fakes, &project);

    assert!(matches!(
        actions.as_slice(),
        [Action::RecoverStale { workflow_id, stale_for_secs: 660 }] if workflow_id == "wf-1"
    ));
    // The oracle is unreachable, so the stall is handed to a human.
    assert!(matches!(
        stop,
        LoopStop::NeedsAttention {
            trigger: RecoveryTrigger::Staleness,
            ..
        }
    ));
}

#[test]
fn exhausted_heal_attempts_need_attention_without_the_oracle() {
    let project = TestProject::initialized("orch-1");
    at_step(&project, StepName::Verify, StepStatus::Failed, false);
    let (state, mut execution) = project.read_documents();
    execution.heal_attempts = 2;
    execution.config.max_heal_attempts = 2;
    project.write_documents(&state, &execution);
    let fakes = Fakes::new("orch-1");

    let (actions, stop) = actions_of(&fakes, &project);

    assert!(matches!(
        actions.as_slice(),
        [Action::NeedsAttention {
            trigger: RecoveryTrigger::StepFailure,
            ..
        }]
    ));
    assert!(matches!(
        stop,
        LoopStop::NeedsAttention {
            trigger: RecoveryTrigger::StepFailure,
            ..
        }
    ));
    assert_eq!(fakes.oracle.calls(), 0);
    let execution = project.read_documents().1;
    let context = execution.recovery_context.expect("recovery context");
    assert_eq!(context.trigger, RecoveryTrigger::StepFailure);
}

#[test]
fn full_run_walks_every_step_and_archives() {
    let project = TestProject::initialized("orch-1");
    project.write_file(
        "tasks.md",
        "# Tasks\n\n## Setup\n- [ ] T001 scaffold\n\n## Core\n- [ ] T002 engine\n- [ ] T003 api\n",
    );
    let (state, mut execution) = project.read_documents();
    execution.config.auto_merge = true;
    project.write_documents(&state, &execution);
    let fakes = Fakes::new("orch-1").with_max_iterations(50);

    let mut actions = Vec::new();
    let outcome = run_loop(&fakes.deps(&project), |report| {
        finish_launched_work(&project, &fakes, &report.decision.action);
        actions.push(report.decision.action.name());
    })
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(
        fakes.launcher.skills(),
        vec!["design", "analyze", "implement", "implement", "verify", "merge"]
    );
    assert!(actions.contains(&"initialize_batches"));
    assert!(actions.contains(&"advance_batch"));
    assert!(actions.contains(&"force_step_complete"));
    assert_eq!(actions.last(), Some(&"complete"));
    assert!(!project.paths().state_path.exists());
    assert_eq!(
        std::fs::read_dir(&project.paths().archive_dir)
            .expect("archive")
            .count(),
        1
    );
}

#[test]
fn failed_batch_is_healed_then_completes() {
    let project = TestProject::initialized("orch-1");
    project.write_file("tasks.md", "## Only\n- [ ] T001 everything\n");
    at_step(&project, StepName::Implement, StepStatus::NotStarted, false);
    let fakes = Fakes::new("orch-1").with_max_iterations(3);

    // initialize_batches, spawn_batch, then the batch workflow fails.
    let (actions, _) = actions_of(&fakes, &project);
    assert_eq!(
        actions.iter().map(Action::name).collect::<Vec<_>>(),
        vec!["initialize_batches", "spawn_batch", "wait"]
    );
    let workflow_id = project
        .read_documents()
        .1
        .workflow_id
        .expect("batch workflow");
    fakes
        .workflows
        .set_status(&workflow_id, WorkflowStatus::Failed);

    let fakes = fakes.with_max_iterations(1);
    let (actions, _) = actions_of(&fakes, &project);
    assert_eq!(
        actions,
        vec![Action::HealBatch {
            batch_index: 0,
            attempt: 1
        }]
    );
    let heal_id = project
        .read_documents()
        .1
        .workflow_id
        .expect("heal workflow");
    fakes.workflows.set_status(&heal_id, WorkflowStatus::Completed);

    let (actions, _) = actions_of(&fakes, &project);
    assert_eq!(actions, vec![Action::ForceStepComplete]);
    let execution = project.read_documents().1;
    assert_eq!(execution.batches.items[0].status, BatchStatus::Healed);
    assert_eq!(execution.batches.items[0].heal_attempts, 1);
}

#[test]
fn unrecognised_step_status_is_resolved_by_the_oracle() {
    let project = TestProject::initialized("orch-1");
    at_step(&project, StepName::Design, StepStatus::Unknown, false);
    let fakes = Fakes::new("orch-1")
        .with_oracle_answers(vec![json!({
            "step": "analyze",
            "status": "not_started",
            "confidence": 0.95,
            "reasoning": "design artifacts are complete"
        })])
        .with_max_iterations(2);

    let (actions, _) = actions_of(&fakes, &project);

    assert!(matches!(actions[0], Action::RecoverUnknown { .. }));
    assert_eq!(
        actions[1],
        Action::Spawn {
            step: StepName::Analyze,
            skill: "analyze".to_string(),
            initialize_batches: false,
        }
    );
    assert_eq!(fakes.oracle.calls(), 1);
    let (state, execution) = project.read_documents();
    assert_eq!(state.step.current, StepName::Analyze);
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert!(
        execution
            .decision_log
            .iter()
            .any(|entry| entry.action == "recover_state" && entry.reason.contains("Oracle"))
    );
}

#[test]
fn unrecognised_step_status_without_any_answer_needs_attention() {
    let project = TestProject::initialized("orch-1");
    at_step(&project, StepName::Design, StepStatus::Unknown, false);
    let fakes = Fakes::new("orch-1");

    let (actions, stop) = actions_of(&fakes, &project);

    assert!(matches!(actions.as_slice(), [Action::RecoverUnknown { .. }]));
    assert_eq!(fakes.oracle.calls(), 1);
    assert!(matches!(
        stop,
        LoopStop::NeedsAttention {
            trigger: RecoveryTrigger::UnknownState,
            ..
        }
    ));
}

#[test]
fn worker_spend_past_the_budget_fails_the_run() {
    let project = TestProject::initialized("orch-1");
    at_step(&project, StepName::Design, StepStatus::InProgress, false);
    let (state, mut execution) = project.read_documents();
    execution.workflow_id = Some("wf-1".to_string());
    execution.workflow_spawned_at = Some(fixed_now() - TimeDelta::minutes(30));
    project.write_documents(&state, &execution);
    let fakes = Fakes::new("orch-1");
    fakes.workflows.insert(Workflow {
        cost_usd: Some(30.0),
        ..workflow("wf-1", "orch-1", WorkflowStatus::Completed)
    });

    let (actions, stop) = actions_of(&fakes, &project);

    assert_eq!(
        actions,
        vec![Action::Fail {
            trigger: RecoveryTrigger::ResourceExhaustion
        }]
    );
    assert!(matches!(stop, LoopStop::Failed { .. }));
    let execution = project.read_documents().1;
    assert_eq!(execution.total_cost_usd, 30.0);
    assert_eq!(execution.status, ExecutionStatus::Failed);
}
