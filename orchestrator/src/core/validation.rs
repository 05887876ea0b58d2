//! Cross-document invariants not expressible via JSON Schema.
//!
//! [`validate`] only reports. [`repair`] fixes the issues whose correct value
//! can be derived from the rest of the documents and leaves everything else
//! for corruption recovery.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::state::{
    Execution, ExecutionStatus, OrchestrationState, RecoveryContext, RecoveryTrigger, StepName,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    StepIndexMismatch { step: StepName, index: u32 },
    PhaseMarkerMismatch { step: StepName, marker: StepName },
    OrchestrationIdMismatch { state: String, execution: String },
    BatchTotalMismatch { total: u32, items: usize },
    BatchIndexMismatch { position: usize, index: u32 },
    BatchCurrentOutOfRange { current: u32, total: u32 },
    RecoveryContextMissing,
    RecoveryContextUnexpected { status: ExecutionStatus },
}

impl Issue {
    /// True when [`repair`] can derive the correct value.
    pub fn is_repairable(&self) -> bool {
        !matches!(
            self,
            Issue::OrchestrationIdMismatch { .. } | Issue::BatchIndexMismatch { .. }
        )
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::StepIndexMismatch { step, index } => write!(
                f,
                "step.index {index} does not match step {} (expected {})",
                step.as_str(),
                step.index()
            ),
            Issue::PhaseMarkerMismatch { step, marker } => write!(
                f,
                "execution.currentPhase {} does not match step {}",
                marker.as_str(),
                step.as_str()
            ),
            Issue::OrchestrationIdMismatch { state, execution } => write!(
                f,
                "orchestration id {state} does not match execution id {execution}"
            ),
            Issue::BatchTotalMismatch { total, items } => {
                write!(f, "batches.total {total} but {items} items")
            }
            Issue::BatchIndexMismatch { position, index } => {
                write!(f, "batch at position {position} has index {index}")
            }
            Issue::BatchCurrentOutOfRange { current, total } => write!(
                f,
                "batches.current {current} out of range for {total} batches"
            ),
            Issue::RecoveryContextMissing => {
                write!(f, "needs_attention without a recoveryContext")
            }
            Issue::RecoveryContextUnexpected { status } => {
                write!(f, "recoveryContext present while status is {status:?}")
            }
        }
    }
}

/// Check every cross-field and cross-document rule. Never mutates.
pub fn validate(state: &OrchestrationState, execution: &Execution) -> Vec<Issue> {
    let mut issues = Vec::new();

    if state.step.index != state.step.current.index() {
        issues.push(Issue::StepIndexMismatch {
            step: state.step.current,
            index: state.step.index,
        });
    }
    if execution.current_phase != state.step.current {
        issues.push(Issue::PhaseMarkerMismatch {
            step: state.step.current,
            marker: execution.current_phase,
        });
    }
    if state.orchestration_id != execution.orchestration_id {
        issues.push(Issue::OrchestrationIdMismatch {
            state: state.orchestration_id.clone(),
            execution: execution.orchestration_id.clone(),
        });
    }

    let batches = &execution.batches;
    if batches.total as usize != batches.items.len() {
        issues.push(Issue::BatchTotalMismatch {
            total: batches.total,
            items: batches.items.len(),
        });
    }
    for (position, batch) in batches.items.iter().enumerate() {
        if batch.index as usize != position {
            issues.push(Issue::BatchIndexMismatch {
                position,
                index: batch.index,
            });
        }
    }
    if !batches.items.is_empty()
        && !batches.all_done()
        && batches.current as usize >= batches.items.len()
    {
        issues.push(Issue::BatchCurrentOutOfRange {
            current: batches.current,
            total: batches.total,
        });
    }

    match (execution.status, &execution.recovery_context) {
        (ExecutionStatus::NeedsAttention, None) => issues.push(Issue::RecoveryContextMissing),
        (status, Some(_)) if status != ExecutionStatus::NeedsAttention => {
            issues.push(Issue::RecoveryContextUnexpected { status });
        }
        _ => {}
    }

    issues
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub state: OrchestrationState,
    pub execution: Execution,
    pub repaired: Vec<Issue>,
    pub remaining: Vec<Issue>,
}

/// Apply mechanical fixes for the repairable issues.
///
/// `step.current` is authoritative over `step.index` and the phase marker.
/// An out-of-range `batches.current` moves to the first batch not yet done.
pub fn repair(
    state: &OrchestrationState,
    execution: &Execution,
    issues: &[Issue],
    now: DateTime<Utc>,
) -> RepairOutcome {
    let mut state = state.clone();
    let mut execution = execution.clone();
    let mut repaired = Vec::new();
    let mut remaining = Vec::new();

    for issue in issues {
        if !issue.is_repairable() {
            remaining.push(issue.clone());
            continue;
        }
        match issue {
            Issue::StepIndexMismatch { .. } => state.step.index = state.step.current.index(),
            Issue::PhaseMarkerMismatch { .. } => execution.current_phase = state.step.current,
            Issue::BatchTotalMismatch { .. } => {
                execution.batches.total = execution.batches.items.len() as u32;
            }
            Issue::BatchCurrentOutOfRange { .. } => {
                let first_open = execution
                    .batches
                    .items
                    .iter()
                    .position(|batch| !batch.status.is_done())
                    .unwrap_or(execution.batches.items.len());
                execution.batches.current = first_open as u32;
            }
            Issue::RecoveryContextMissing => {
                execution.recovery_context = Some(RecoveryContext {
                    issue: "needs attention".to_string(),
                    reason: "no recovery context was recorded".to_string(),
                    trigger: RecoveryTrigger::UnknownState,
                    attempts: execution.heal_attempts,
                    suggested_action: None,
                    recorded_at: now,
                });
            }
            Issue::RecoveryContextUnexpected { .. } => execution.recovery_context = None,
            Issue::OrchestrationIdMismatch { .. } | Issue::BatchIndexMismatch { .. } => {}
        }
        repaired.push(issue.clone());
    }

    RepairOutcome {
        state,
        execution,
        repaired,
        remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Batch, BatchStatus, Batches, ExecutionConfig, Step, StepStatus};

    fn documents() -> (OrchestrationState, Execution) {
        let state = OrchestrationState::new("orch-1");
        let execution = Execution::new("orch-1", ExecutionConfig::default(), Utc::now());
        (state, execution)
    }

    fn batch(index: u32, status: BatchStatus) -> Batch {
        Batch {
            index,
            section: format!("Phase {index}"),
            task_ids: vec![format!("T00{index}")],
            status,
            workflow_id: None,
            heal_attempts: 0,
        }
    }

    #[test]
    fn fresh_documents_are_consistent() {
        let (state, execution) = documents();
        assert!(validate(&state, &execution).is_empty());
    }

    #[test]
    fn validate_reports_every_violation() {
        let (mut state, mut execution) = documents();
        state.step = Step {
            current: StepName::Implement,
            status: Some(StepStatus::InProgress),
            index: 0,
        };
        execution.orchestration_id = "orch-2".to_string();
        execution.batches = Batches {
            total: 3,
            current: 5,
            items: vec![batch(0, BatchStatus::Completed), batch(0, BatchStatus::Pending)],
        };
        execution.status = ExecutionStatus::NeedsAttention;

        let issues = validate(&state, &execution);
        assert!(issues.contains(&Issue::StepIndexMismatch {
            step: StepName::Implement,
            index: 0
        }));
        assert!(issues.contains(&Issue::PhaseMarkerMismatch {
            step: StepName::Implement,
            marker: StepName::Design
        }));
        assert!(issues.contains(&Issue::OrchestrationIdMismatch {
            state: "orch-1".to_string(),
            execution: "orch-2".to_string()
        }));
        assert!(issues.contains(&Issue::BatchTotalMismatch { total: 3, items: 2 }));
        assert!(issues.contains(&Issue::BatchIndexMismatch {
            position: 1,
            index: 0
        }));
        assert!(issues.contains(&Issue::BatchCurrentOutOfRange {
            current: 5,
            total: 3
        }));
        assert!(issues.contains(&Issue::RecoveryContextMissing));
    }

    #[test]
    fn current_may_point_past_the_end_once_every_batch_is_done() {
        let (mut state, mut execution) = documents();
        state.enter_step(StepName::Implement);
        execution.current_phase = StepName::Implement;
        execution.batches = Batches {
            total: 2,
            current: 2,
            items: vec![batch(0, BatchStatus::Completed), batch(1, BatchStatus::Healed)],
        };
        assert!(validate(&state, &execution).is_empty());
    }

    #[test]
    fn repair_fixes_derivable_issues_and_keeps_the_rest() {
        let (mut state, mut execution) = documents();
        state.step.current = StepName::Verify;
        execution.orchestration_id = "other".to_string();
        execution.batches = Batches {
            total: 2,
            current: 7,
            items: vec![batch(0, BatchStatus::Completed), batch(1, BatchStatus::Pending)],
        };

        let issues = validate(&state, &execution);
        let outcome = repair(&state, &execution, &issues, Utc::now());

        assert_eq!(outcome.state.step.index, StepName::Verify.index());
        assert_eq!(outcome.execution.current_phase, StepName::Verify);
        assert_eq!(outcome.execution.batches.current, 1);
        assert_eq!(outcome.remaining.len(), 1);
        assert!(matches!(
            outcome.remaining[0],
            Issue::OrchestrationIdMismatch { .. }
        ));
        let revalidated = validate(&outcome.state, &outcome.execution);
        assert_eq!(revalidated, outcome.remaining);
    }

    #[test]
    fn repair_drops_stray_recovery_context() {
        let (state, mut execution) = documents();
        execution.recovery_context = Some(RecoveryContext {
            issue: "old".to_string(),
            reason: "old".to_string(),
            trigger: RecoveryTrigger::Staleness,
            attempts: 0,
            suggested_action: None,
            recorded_at: Utc::now(),
        });
        let issues = validate(&state, &execution);
        let outcome = repair(&state, &execution, &issues, Utc::now());
        assert_eq!(outcome.execution.recovery_context, None);
        assert!(outcome.remaining.is_empty());
    }
}
