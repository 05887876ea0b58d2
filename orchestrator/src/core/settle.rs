//! Fold a finished workflow back into the documents.
//!
//! Workers own the step status, but a batch is only known to be done when the
//! workflow running it ends. This runs before each decision so the batch
//! state machine sees the outcome.

use crate::core::decision::WorkflowSnapshot;
use crate::state::{
    BatchStatus, Execution, OrchestrationState, StepName, StepStatus, WorkflowStatus,
};

/// What settling changed, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Batch {
        index: u32,
        status: BatchStatus,
    },
    /// The step's workflow failed while the step still read in progress.
    StepFailed {
        workflow_id: String,
    },
    /// The tracked workflow ended with nothing else to record.
    Released {
        workflow_id: String,
    },
}

/// Settle the tracked workflow when it has finished. `None` when it has not.
pub fn settle_finished_workflow(
    state: &mut OrchestrationState,
    execution: &mut Execution,
    snapshot: &WorkflowSnapshot,
) -> Option<Settlement> {
    let WorkflowSnapshot::Found(workflow) = snapshot else {
        return None;
    };
    if workflow.is_active() || execution.workflow_id.as_deref() != Some(workflow.id.as_str()) {
        return None;
    }
    let succeeded = workflow.status == WorkflowStatus::Completed;
    let workflow_id = workflow.id.clone();
    execution.clear_workflow();
    // Settling happens once per workflow, so its spend is charged exactly once.
    if let Some(cost) = workflow.cost_usd.filter(|cost| cost.is_finite() && *cost > 0.0) {
        execution.total_cost_usd += cost;
    }

    if state.step.current == StepName::Implement
        && let Some(batch) = execution.batches.active_mut()
        && batch.status == BatchStatus::Running
        && batch.workflow_id.as_deref() == Some(workflow_id.as_str())
    {
        batch.status = match (succeeded, batch.heal_attempts) {
            (true, 0) => BatchStatus::Completed,
            (true, _) => BatchStatus::Healed,
            (false, _) => BatchStatus::Failed,
        };
        if !succeeded {
            execution.last_error = Some(format!(
                "batch {} workflow {workflow_id} failed",
                batch.index + 1
            ));
        }
        return Some(Settlement::Batch {
            index: batch.index,
            status: batch.status,
        });
    }

    if !succeeded && state.step.status == Some(StepStatus::InProgress) {
        state.step.status = Some(StepStatus::Failed);
        execution.last_error = Some(format!(
            "{} workflow {workflow_id} failed",
            state.step.current.as_str()
        ));
        return Some(Settlement::StepFailed { workflow_id });
    }
    Some(Settlement::Released { workflow_id })
}
