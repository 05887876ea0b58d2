//! Artifact-based guess of where a run left off.
//!
//! Used when the state document is unusable and the oracle could not give a
//! confident answer. The guess always restarts the inferred step from scratch.

use crate::core::tasks::TaskSummary;
use crate::state::StepName;

/// Confidence reported for every heuristic guess.
pub const HEURISTIC_CONFIDENCE: f64 = 0.5;

/// What the project directory shows about pipeline progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArtifactSignals {
    pub has_spec: bool,
    pub has_plan: bool,
    /// `None` when the task list file is absent.
    pub tasks: Option<TaskSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicGuess {
    pub step: StepName,
    pub reason: String,
    pub confidence: f64,
}

/// First matching signal wins.
pub fn infer_step(signals: &ArtifactSignals) -> Option<HeuristicGuess> {
    let (step, reason) = match signals.tasks {
        Some(summary) if summary.all_checked() => (
            StepName::Verify,
            format!("task list has all {} tasks checked", summary.total),
        ),
        Some(summary) if summary.total > 0 => (
            StepName::Implement,
            format!(
                "task list has {} of {} tasks checked",
                summary.checked, summary.total
            ),
        ),
        _ if signals.has_plan => (StepName::Analyze, "plan artifact present".to_string()),
        _ if signals.has_spec => (StepName::Analyze, "spec artifact present".to_string()),
        _ => return None,
    };
    Some(HeuristicGuess {
        step,
        reason,
        confidence: HEURISTIC_CONFIDENCE,
    })
}
