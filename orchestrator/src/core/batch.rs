//! Batch sub-state-machine for the implement step.
//!
//! Consulted before the generic rules while implementing. `None` defers to
//! them: the generic rules then wait on the active workflow, apply the gates
//! or react to the step status.

use crate::core::decision::{Action, Decision, DecisionInput};
use crate::state::{BatchStatus, StepName, StepStatus};

pub fn decide_batch(input: &DecisionInput<'_>) -> Option<Decision> {
    let execution = input.execution;
    let batches = &execution.batches;

    if batches.total == 0 {
        return Some(Decision::new(
            Action::InitializeBatches,
            "implement entered without batches",
        ));
    }

    if batches.all_done() {
        if input.state.step.status != Some(StepStatus::Complete) {
            return Some(Decision::new(
                Action::ForceStepComplete,
                format!("all {} batches done", batches.total),
            ));
        }
        return None;
    }

    let batch = batches.active()?;
    let next_index = batch.index + 1;
    let has_next = next_index < batches.total;

    match batch.status {
        BatchStatus::Pending if input.workflow.active().is_none() => Some(Decision::new(
            Action::SpawnBatch {
                batch_index: batch.index,
                section: batch.section.clone(),
                task_ids: batch.task_ids.clone(),
            },
            format!(
                "starting batch {}/{}: {}",
                batch.index + 1,
                batches.total,
                batch.section
            ),
        )),
        BatchStatus::Completed if has_next && execution.config.pause_between_batches => {
            Some(Decision::new(
                Action::Pause {
                    batch_index: next_index,
                },
                format!("batch {} done, pausing before the next", batch.index + 1),
            ))
        }
        BatchStatus::Completed | BatchStatus::Healed if has_next => Some(Decision::new(
            Action::AdvanceBatch {
                batch_index: next_index,
            },
            format!("batch {} done", batch.index + 1),
        )),
        BatchStatus::Failed
            if execution.config.auto_heal_enabled
                && batch.heal_attempts < execution.config.max_heal_attempts =>
        {
            Some(Decision::new(
                Action::HealBatch {
                    batch_index: batch.index,
                    attempt: batch.heal_attempts + 1,
                },
                format!(
                    "batch {} failed, heal attempt {} of {}",
                    batch.index + 1,
                    batch.heal_attempts + 1,
                    execution.config.max_heal_attempts
                ),
            ))
        }
        BatchStatus::Failed => Some(Decision::new(
            Action::RecoverFailed {
                step: StepName::Implement,
                batch_index: Some(batch.index),
                attempts: batch.heal_attempts,
                max_attempts: execution.config.max_heal_attempts,
            },
            format!("batch {} failed, auto-heal unavailable", batch.index + 1),
        )),
        // Running with a live workflow, pending behind an active workflow,
        // and a done batch with nothing after it all defer.
        BatchStatus::Pending
        | BatchStatus::Running
        | BatchStatus::Completed
        | BatchStatus::Healed => None,
    }
}
