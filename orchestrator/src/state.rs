//! Persisted orchestration documents.
//!
//! Field names serialize as camelCase and enum values as snake_case; the
//! dashboard parses these files directly, so renames are breaking changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline step, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Design,
    Analyze,
    Implement,
    Verify,
    Merge,
}

impl StepName {
    pub const ALL: [StepName; 5] = [
        StepName::Design,
        StepName::Analyze,
        StepName::Implement,
        StepName::Verify,
        StepName::Merge,
    ];

    /// Canonical position of the step in the pipeline.
    pub fn index(self) -> u32 {
        match self {
            StepName::Design => 0,
            StepName::Analyze => 1,
            StepName::Implement => 2,
            StepName::Verify => 3,
            StepName::Merge => 4,
        }
    }

    pub fn next(self) -> Option<StepName> {
        match self {
            StepName::Design => Some(StepName::Analyze),
            StepName::Analyze => Some(StepName::Implement),
            StepName::Implement => Some(StepName::Verify),
            StepName::Verify => Some(StepName::Merge),
            StepName::Merge => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::Design => "design",
            StepName::Analyze => "analyze",
            StepName::Implement => "implement",
            StepName::Verify => "verify",
            StepName::Merge => "merge",
        }
    }

    /// Worker skill that drives this step.
    pub fn skill(self) -> &'static str {
        self.as_str()
    }
}

/// Step progress as written by the loop and by workers.
///
/// Values written by other tools that this build does not know deserialize
/// to [`StepStatus::Unknown`] instead of failing the whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Complete,
    Failed,
    Blocked,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub current: StepName,
    pub status: Option<StepStatus>,
    pub index: u32,
}

impl Step {
    pub fn new(current: StepName, status: StepStatus) -> Self {
        Self {
            current,
            status: Some(status),
            index: current.index(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserGateStatus {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub number: u32,
    pub name: String,
    pub has_user_gate: bool,
    pub user_gate_status: Option<UserGateStatus>,
}

impl Phase {
    /// True when a configured gate still waits for confirmation.
    pub fn gate_blocks(&self) -> bool {
        self.has_user_gate && self.user_gate_status != Some(UserGateStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Durable per-project orchestration document (`state/orchestration.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationState {
    pub orchestration_id: String,
    pub step: Step,
    pub phase: Phase,
    pub health: Health,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrchestrationState {
    pub fn new(orchestration_id: &str) -> Self {
        Self {
            orchestration_id: orchestration_id.to_string(),
            step: Step::new(StepName::Design, StepStatus::NotStarted),
            phase: Phase {
                number: 1,
                name: "Phase 1".to_string(),
                has_user_gate: false,
                user_gate_status: None,
            },
            health: Health::Healthy,
            updated_at: None,
        }
    }

    /// Move to `next`, resetting step progress.
    pub fn enter_step(&mut self, next: StepName) {
        self.step = Step::new(next, StepStatus::NotStarted);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    WaitingMerge,
    WaitingUserGate,
    NeedsAttention,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// The loop exits on these; nothing but a human brings the run back.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::NeedsAttention
                | ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    /// Spend ceiling in USD. Zero or negative disables the ceiling.
    pub max_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    pub auto_merge: bool,
    pub pause_between_batches: bool,
    pub auto_heal_enabled: bool,
    pub max_heal_attempts: u32,
    pub budget: Budget,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            auto_merge: false,
            pause_between_batches: false,
            auto_heal_enabled: true,
            max_heal_attempts: 2,
            budget: Budget { max_total: 25.0 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Healed,
    Failed,
}

impl BatchStatus {
    pub fn is_done(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Healed)
    }
}

/// A contiguous group of tasks executed by one implement workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub index: u32,
    pub section: String,
    pub task_ids: Vec<String>,
    pub status: BatchStatus,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub heal_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batches {
    pub total: u32,
    pub current: u32,
    pub items: Vec<Batch>,
}

impl Batches {
    pub fn active(&self) -> Option<&Batch> {
        self.items.get(self.current as usize)
    }

    pub fn active_mut(&mut self) -> Option<&mut Batch> {
        self.items.get_mut(self.current as usize)
    }

    pub fn all_done(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|b| b.status.is_done())
    }
}

/// Entries kept in `Execution::decision_log`.
pub const DECISION_LOG_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub reason: String,
}

/// Which failure class put the run into `needs_attention`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    Corruption,
    Staleness,
    StepFailure,
    ResourceExhaustion,
    UnknownState,
    BatchSetup,
}

/// User-facing explanation attached to a `needs_attention` execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContext {
    pub issue: String,
    pub reason: String,
    pub trigger: RecoveryTrigger,
    pub attempts: u32,
    #[serde(default)]
    pub suggested_action: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Per-run execution record (`state/execution.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub orchestration_id: String,
    pub status: ExecutionStatus,
    /// Phase marker; must name the same step as the orchestration document.
    pub current_phase: StepName,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub config: ExecutionConfig,
    #[serde(default)]
    pub batches: Batches,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub heal_attempts: u32,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub workflow_spawned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub workflow_lookup_failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub decision_log: Vec<DecisionLogEntry>,
    #[serde(default)]
    pub recovery_context: Option<RecoveryContext>,
}

impl Execution {
    pub fn new(orchestration_id: &str, config: ExecutionConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            orchestration_id: orchestration_id.to_string(),
            status: ExecutionStatus::Running,
            current_phase: StepName::Design,
            started_at,
            config,
            batches: Batches::default(),
            total_cost_usd: 0.0,
            heal_attempts: 0,
            workflow_id: None,
            workflow_spawned_at: None,
            workflow_lookup_failures: 0,
            last_error: None,
            decision_log: Vec::new(),
            recovery_context: None,
        }
    }

    /// Append to the decision log, dropping the oldest entries past `limit`.
    ///
    /// An entry repeating the previous action and reason is not appended, so
    /// idle iterations leave the document untouched. Returns whether the log
    /// changed.
    pub fn record_decision(&mut self, entry: DecisionLogEntry, limit: usize) -> bool {
        if let Some(last) = self.decision_log.last()
            && last.action == entry.action
            && last.reason == entry.reason
        {
            return false;
        }
        self.decision_log.push(entry);
        if self.decision_log.len() > limit {
            let excess = self.decision_log.len() - limit;
            self.decision_log.drain(..excess);
        }
        true
    }

    pub fn mark_needs_attention(&mut self, context: RecoveryContext) {
        self.status = ExecutionStatus::NeedsAttention;
        self.recovery_context = Some(context);
    }

    /// Forget the tracked workflow (it finished, was cancelled, or vanished).
    pub fn clear_workflow(&mut self) {
        self.workflow_id = None;
        self.workflow_spawned_at = None;
        self.workflow_lookup_failures = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    WaitingForInput,
    Completed,
    Failed,
}

/// Worker session record. Written by workers; read-only to the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub orchestration_id: String,
    pub skill: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Spend reported by the worker session, in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl Workflow {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Running | WorkflowStatus::WaitingForInput
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_canonical() {
        let indices: Vec<u32> = StepName::ALL.iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(StepName::Verify.next(), Some(StepName::Merge));
        assert_eq!(StepName::Merge.next(), None);
    }

    #[test]
    fn unrecognised_step_status_parses_as_unknown() {
        let step: Step =
            serde_json::from_str(r#"{"current":"verify","status":"skipped","index":3}"#)
                .expect("parse");
        assert_eq!(step.status, Some(StepStatus::Unknown));
    }

    #[test]
    fn null_step_status_parses_as_none() {
        let step: Step = serde_json::from_str(r#"{"current":"design","status":null,"index":0}"#)
            .expect("parse");
        assert_eq!(step.status, None);
    }

    #[test]
    fn decision_log_keeps_only_latest_entries() {
        let now = Utc::now();
        let mut execution = Execution::new("orch-1", ExecutionConfig::default(), now);
        for i in 0..25 {
            execution.record_decision(
                DecisionLogEntry {
                    timestamp: now,
                    action: "wait".to_string(),
                    reason: format!("tick {i}"),
                },
                20,
            );
        }
        assert_eq!(execution.decision_log.len(), 20);
        assert_eq!(execution.decision_log[0].reason, "tick 5");
        assert_eq!(execution.decision_log[19].reason, "tick 24");
    }

    #[test]
    fn decision_log_skips_consecutive_duplicates() {
        let now = Utc::now();
        let mut execution = Execution::new("orch-1", ExecutionConfig::default(), now);
        let entry = DecisionLogEntry {
            timestamp: now,
            action: "wait".to_string(),
            reason: "workflow wf-1 running".to_string(),
        };
        assert!(execution.record_decision(entry.clone(), 20));
        assert!(!execution.record_decision(entry, 20));
        assert_eq!(execution.decision_log.len(), 1);
    }

    #[test]
    fn execution_serializes_camel_case_fields() {
        let execution = Execution::new("orch-1", ExecutionConfig::default(), Utc::now());
        let value = serde_json::to_value(&execution).expect("serialize");
        assert!(value.get("totalCostUsd").is_some());
        assert!(value.get("currentPhase").is_some());
        assert_eq!(value["config"]["pauseBetweenBatches"], false);
        assert_eq!(value["status"], "running");
    }
}
