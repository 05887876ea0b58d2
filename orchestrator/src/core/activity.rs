//! Session activity timeline.
//!
//! Workers refresh `lastActivityAt` on their own record, but sessions started
//! from the dashboard or resumed by recovery only show up as appended signals.
//! The loop needs one answer: when did anything last happen for this
//! orchestration?

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    /// Session spawned by the control loop.
    Loop,
    /// Session a human started or resumed by hand.
    Manual,
    /// Recovery decided the workflow is still making progress.
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySignal {
    pub source: ActivitySource,
    #[serde(default)]
    pub session_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Latest observed activity across the workflow record and appended signals.
///
/// A signal carrying a session id other than the workflow's is dropped when it
/// predates the workflow start: it belongs to an earlier session. `spawned_at`
/// is the fallback when nothing else was observed. The result never defaults
/// to the current time.
pub fn last_activity(
    workflow: Option<&Workflow>,
    signals: &[ActivitySignal],
    spawned_at: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let workflow_started = workflow.and_then(|w| w.started_at);
    let workflow_session = workflow.and_then(|w| w.session_id.as_deref());

    let from_signals = signals
        .iter()
        .filter(|signal| {
            let foreign = match (signal.session_id.as_deref(), workflow_session) {
                (Some(signal_session), Some(own)) => signal_session != own,
                _ => false,
            };
            match (foreign, workflow_started) {
                (true, Some(started)) => signal.at >= started,
                _ => true,
            }
        })
        .map(|signal| signal.at);

    workflow
        .and_then(|w| w.last_activity_at)
        .into_iter()
        .chain(from_signals)
        .chain(workflow_started)
        .max()
        .or(spawned_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkflowStatus;
    use chrono::TimeDelta;

    fn workflow(started_at: DateTime<Utc>, last: Option<DateTime<Utc>>) -> Workflow {
        Workflow {
            id: "wf-1".to_string(),
            orchestration_id: "orch-1".to_string(),
            skill: "implement".to_string(),
            status: WorkflowStatus::Running,
            session_id: Some("session-a".to_string()),
            last_activity_at: last,
            started_at: Some(started_at),
            pid: None,
            cost_usd: None,
        }
    }

    #[test]
    fn manual_signal_newer_than_record_wins() {
        let now = Utc::now();
        let wf = workflow(now - TimeDelta::minutes(30), Some(now - TimeDelta::minutes(20)));
        let signals = vec![ActivitySignal {
            source: ActivitySource::Manual,
            session_id: Some("session-b".to_string()),
            at: now - TimeDelta::minutes(2),
        }];
        assert_eq!(
            last_activity(Some(&wf), &signals, None),
            Some(now - TimeDelta::minutes(2))
        );
    }

    #[test]
    fn foreign_session_signal_before_start_is_ignored() {
        let now = Utc::now();
        let started = now - TimeDelta::minutes(30);
        let wf = workflow(started, None);
        let signals = vec![ActivitySignal {
            source: ActivitySource::Loop,
            session_id: Some("old-session".to_string()),
            at: now - TimeDelta::minutes(45),
        }];
        assert_eq!(last_activity(Some(&wf), &signals, None), Some(started));
    }

    #[test]
    fn falls_back_to_spawn_time_without_observations() {
        let spawned = Utc::now() - TimeDelta::minutes(5);
        assert_eq!(last_activity(None, &[], Some(spawned)), Some(spawned));
        assert_eq!(last_activity(None, &[], None), None);
    }
}
