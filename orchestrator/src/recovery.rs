//! Recovery oracle adapter.
//!
//! The only place the diagnostic oracle is consulted. Three triggers are
//! supported, each with a fallback that needs no oracle at all:
//!
//! | trigger | accepted answer | fallback |
//! |---|---|---|
//! | corrupt state | `recover_state` with confidence above 0.7 | artifact heuristic, else unresolved |
//! | stale workflow | `continue`, `restart_task`, `skip_task`, `abort` | escalate |
//! | failed step | `retry`, `skip_tasks`, `run_prerequisite`, `abort` | retry while attempts remain, else escalate |
//!
//! Every answer is validated against its JSON Schema before it is decoded.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{info, instrument, warn};

use crate::core::heuristic::{ArtifactSignals, infer_step};
use crate::core::tasks::summarize;
use crate::io::config::OracleConfig;
use crate::io::oracle::{OracleRequest, OracleTask, RecoveryOracle};
use crate::io::prompt::{
    BatchContext, DiagnoseFailedPrompt, DiagnoseStalePrompt, PromptEngine, RecoverStatePrompt,
};
use crate::io::schema::{
    DIAGNOSE_FAILED_SCHEMA, DIAGNOSE_STALE_SCHEMA, RECOVER_STATE_SCHEMA, parse_schema,
    validate_instance,
};
use crate::io::state_store::StateStore;
use crate::state::{StepName, StepStatus};

/// Oracle answers at or below this confidence are not trusted.
pub const MIN_ORACLE_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    Oracle,
    Heuristic,
}

/// Where a recovered run resumes, and who said so.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredStep {
    pub step: StepName,
    pub status: StepStatus,
    pub source: RecoverySource,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateRecovery {
    Recovered(RecoveredStep),
    /// Neither the oracle nor the artifacts say where the run stands.
    Unresolved { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleResolution {
    /// The worker is slow but alive; keep waiting.
    Continue { reason: String },
    /// Cancel the worker and run the same task again.
    RestartTask { reason: String },
    /// Cancel the worker and move past the task.
    SkipTask { reason: String },
    Abort { reason: String },
    /// No usable answer; a human has to look.
    Escalate { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailedResolution {
    Retry { reason: String },
    SkipTasks { task_ids: Vec<String>, reason: String },
    RunPrerequisite { skill: String, reason: String },
    Abort { reason: String },
    Escalate { reason: String },
}

/// What the loop knows about a stale workflow.
#[derive(Debug, Clone)]
pub struct StaleContext<'a> {
    pub orchestration_id: &'a str,
    pub step: StepName,
    pub batch: Option<BatchContext>,
    pub workflow_id: &'a str,
    pub stale_for: Duration,
    pub transcript: Option<&'a str>,
}

/// What the loop knows about a failed or blocked step.
#[derive(Debug, Clone)]
pub struct FailedContext<'a> {
    pub orchestration_id: &'a str,
    pub step: StepName,
    pub batch: Option<BatchContext>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RecoverStateAnswer {
    step: StepName,
    status: StepStatus,
    confidence: f64,
    reasoning: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StaleAnswerAction {
    Continue,
    RestartTask,
    SkipTask,
    Abort,
}

#[derive(Debug, Deserialize)]
struct StaleAnswer {
    action: StaleAnswerAction,
    reasoning: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FailedAnswerAction {
    Retry,
    SkipTasks,
    RunPrerequisite,
    Abort,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailedAnswer {
    action: FailedAnswerAction,
    reasoning: String,
    #[serde(default)]
    prerequisite_skill: Option<String>,
    #[serde(default)]
    task_ids: Vec<String>,
}

pub struct RecoveryAdapter {
    oracle: Arc<dyn RecoveryOracle>,
    config: OracleConfig,
    prompts: PromptEngine,
    artifacts_dir: PathBuf,
    tasks_path: PathBuf,
    /// Oracle spend not yet charged to the run.
    unbilled_usd: Mutex<f64>,
}

impl RecoveryAdapter {
    pub fn new(
        oracle: Arc<dyn RecoveryOracle>,
        config: OracleConfig,
        artifacts_dir: impl Into<PathBuf>,
        tasks_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            oracle,
            config,
            prompts: PromptEngine::new()?,
            artifacts_dir: artifacts_dir.into(),
            tasks_path: tasks_path.into(),
            unbilled_usd: Mutex::new(0.0),
        })
    }

    /// Oracle spend since the last call, reset to zero.
    pub fn take_spend(&self) -> f64 {
        let mut unbilled = self
            .unbilled_usd
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *unbilled)
    }

    /// Work out where a run with an unusable state document stands.
    ///
    /// The documents are backed up first; a failed backup aborts recovery so
    /// nothing is overwritten without a copy.
    #[instrument(skip_all, fields(orchestration_id = orchestration_id))]
    pub fn recover_state(
        &self,
        store: &StateStore,
        orchestration_id: &str,
        problem: &str,
        now: DateTime<Utc>,
    ) -> Result<StateRecovery> {
        store.backup(now).context("back up state before recovery")?;

        let (signals, artifacts) = self.scan_artifacts();
        let raw_state = store.read_raw_state();
        let answer = self
            .prompts
            .render_recover_state(&RecoverStatePrompt {
                orchestration_id,
                problem,
                raw_state: raw_state.as_deref(),
                artifacts: &artifacts,
            })
            .and_then(|prompt| {
                self.consult::<RecoverStateAnswer>(
                    OracleTask::RecoverState,
                    prompt,
                    RECOVER_STATE_SCHEMA,
                )
            });

        match answer {
            Ok(answer) if answer.confidence > MIN_ORACLE_CONFIDENCE => {
                info!(
                    step = answer.step.as_str(),
                    confidence = answer.confidence,
                    "state recovered by oracle"
                );
                return Ok(StateRecovery::Recovered(RecoveredStep {
                    step: answer.step,
                    status: answer.status,
                    source: RecoverySource::Oracle,
                    confidence: answer.confidence,
                    reason: answer.reasoning,
                }));
            }
            Ok(answer) => warn!(
                confidence = answer.confidence,
                "oracle answer below confidence threshold"
            ),
            Err(err) => warn!(err = %format!("{err:#}"), "oracle state recovery failed"),
        }

        match infer_step(&signals) {
            Some(guess) => {
                info!(step = guess.step.as_str(), reason = %guess.reason, "state recovered from artifacts");
                Ok(StateRecovery::Recovered(RecoveredStep {
                    step: guess.step,
                    status: StepStatus::NotStarted,
                    source: RecoverySource::Heuristic,
                    confidence: guess.confidence,
                    reason: guess.reason,
                }))
            }
            None => Ok(StateRecovery::Unresolved {
                reason: format!("{problem}; no confident oracle answer and no artifacts to infer from"),
            }),
        }
    }

    #[instrument(skip_all, fields(workflow_id = context.workflow_id))]
    pub fn diagnose_stale(&self, context: &StaleContext<'_>) -> StaleResolution {
        let answer = self
            .prompts
            .render_diagnose_stale(&DiagnoseStalePrompt {
                orchestration_id: context.orchestration_id,
                step: context.step.as_str(),
                batch: context.batch.clone(),
                workflow_id: context.workflow_id,
                idle_minutes: context.stale_for.as_secs() / 60,
                transcript: context.transcript,
            })
            .and_then(|prompt| {
                self.consult::<StaleAnswer>(
                    OracleTask::DiagnoseStaleWorkflow,
                    prompt,
                    DIAGNOSE_STALE_SCHEMA,
                )
            });

        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "stale diagnosis failed");
                return StaleResolution::Escalate {
                    reason: format!(
                        "workflow {} idle for {}s and could not be diagnosed: {err:#}",
                        context.workflow_id,
                        context.stale_for.as_secs()
                    ),
                };
            }
        };
        info!(action = ?answer.action, "stale workflow diagnosed");
        let reason = answer.reasoning;
        match answer.action {
            StaleAnswerAction::Continue => StaleResolution::Continue { reason },
            StaleAnswerAction::RestartTask => StaleResolution::RestartTask { reason },
            StaleAnswerAction::SkipTask => StaleResolution::SkipTask { reason },
            StaleAnswerAction::Abort => StaleResolution::Abort { reason },
        }
    }

    #[instrument(skip_all, fields(step = context.step.as_str(), attempts = context.attempts))]
    pub fn diagnose_failed(&self, context: &FailedContext<'_>) -> FailedResolution {
        if context.attempts >= context.max_attempts {
            return FailedResolution::Escalate {
                reason: format!(
                    "{} failed after {} of {} recovery attempts",
                    context.step.as_str(),
                    context.attempts,
                    context.max_attempts
                ),
            };
        }

        let answer = self
            .prompts
            .render_diagnose_failed(&DiagnoseFailedPrompt {
                orchestration_id: context.orchestration_id,
                step: context.step.as_str(),
                batch: context.batch.clone(),
                attempts: context.attempts,
                max_attempts: context.max_attempts,
                last_error: context.last_error,
            })
            .and_then(|prompt| {
                self.consult::<FailedAnswer>(
                    OracleTask::DiagnoseFailedStep,
                    prompt,
                    DIAGNOSE_FAILED_SCHEMA,
                )
            });

        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failure diagnosis failed, retrying");
                return FailedResolution::Retry {
                    reason: format!("oracle unavailable ({err:#}); simple retry"),
                };
            }
        };
        info!(action = ?answer.action, "failed step diagnosed");
        let reason = answer.reasoning;
        match answer.action {
            FailedAnswerAction::Retry => FailedResolution::Retry { reason },
            FailedAnswerAction::SkipTasks => FailedResolution::SkipTasks {
                task_ids: answer.task_ids,
                reason,
            },
            FailedAnswerAction::RunPrerequisite => match answer.prerequisite_skill {
                Some(skill) => FailedResolution::RunPrerequisite { skill, reason },
                None => FailedResolution::Retry { reason },
            },
            FailedAnswerAction::Abort => FailedResolution::Abort { reason },
        }
    }

    fn consult<T: DeserializeOwned>(
        &self,
        task: OracleTask,
        prompt: String,
        schema: &str,
    ) -> Result<T> {
        let schema = parse_schema(schema)?;
        let request = OracleRequest {
            task,
            context: prompt,
            model_tier: self.config.model_tier.clone(),
            allowed_tools: self.config.allowed_tools.clone(),
            max_turns: self.config.max_turns,
            max_budget_usd: self.config.max_budget_usd,
            response_schema: schema.clone(),
        };
        let answer = self.oracle.ask(&request)?;
        if let Some(cost) = answer.cost_usd.filter(|cost| cost.is_finite() && *cost > 0.0) {
            *self
                .unbilled_usd
                .lock()
                .unwrap_or_else(PoisonError::into_inner) += cost;
        }
        validate_instance(&answer.value, &schema).context("oracle answer rejected")?;
        serde_json::from_value(answer.value).context("decode oracle answer")
    }

    /// Artifact signals for the heuristic plus a listing for the prompt.
    fn scan_artifacts(&self) -> (ArtifactSignals, Vec<String>) {
        let mut listing = Vec::new();
        let has_spec = self.artifacts_dir.join("spec.md").is_file();
        if has_spec {
            listing.push("spec.md".to_string());
        }
        let has_plan = self.artifacts_dir.join("plan.md").is_file();
        if has_plan {
            listing.push("plan.md".to_string());
        }
        let tasks = match fs::read_to_string(&self.tasks_path) {
            Ok(contents) => {
                let summary = summarize(&contents);
                listing.push(format!(
                    "{} ({} of {} tasks checked)",
                    self.tasks_path.display(),
                    summary.checked,
                    summary.total
                ));
                Some(summary)
            }
            Err(_) => None,
        };
        (
            ArtifactSignals {
                has_spec,
                has_plan,
                tasks,
            },
            listing,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::init::OrchestratorPaths;
    use crate::test_support::{ScriptedOracle, TestProject};
    use serde_json::json;

    fn adapter(project: &TestProject, oracle: Arc<ScriptedOracle>) -> RecoveryAdapter {
        RecoveryAdapter::new(
            oracle,
            OracleConfig::default(),
            project.root(),
            project.root().join("tasks.md"),
        )
        .expect("adapter")
    }

    fn failed_context(attempts: u32) -> FailedContext<'static> {
        FailedContext {
            orchestration_id: "orch-1",
            step: StepName::Verify,
            batch: None,
            attempts,
            max_attempts: 2,
            last_error: Some("tests failed"),
        }
    }

    #[test]
    fn confident_oracle_answer_recovers_state_after_backup() {
        let project = TestProject::initialized("orch-1");
        project.write_raw_state("{\"step\": ");
        let oracle = Arc::new(ScriptedOracle::answering(vec![json!({
            "step": "implement",
            "status": "in_progress",
            "confidence": 0.9,
            "reasoning": "tasks partly checked"
        })]));
        let adapter = adapter(&project, oracle.clone());

        let outcome = adapter
            .recover_state(&project.store(), "orch-1", "state is not json", Utc::now())
            .expect("recover");

        assert_eq!(
            outcome,
            StateRecovery::Recovered(RecoveredStep {
                step: StepName::Implement,
                status: StepStatus::InProgress,
                source: RecoverySource::Oracle,
                confidence: 0.9,
                reason: "tasks partly checked".to_string(),
            })
        );
        assert_eq!(oracle.tasks(), vec![OracleTask::RecoverState]);
        let backups = fs::read_dir(OrchestratorPaths::new(project.root()).backups_dir)
            .expect("backups")
            .count();
        assert!(backups >= 1);
    }

    #[test]
    fn low_confidence_answer_falls_back_to_artifacts() {
        let project = TestProject::initialized("orch-1");
        project.write_file("tasks.md", "## Setup\n- [x] T001 a\n- [ ] T002 b\n");
        let oracle = Arc::new(ScriptedOracle::answering(vec![json!({
            "step": "merge",
            "status": "complete",
            "confidence": 0.4,
            "reasoning": "guessing"
        })]));
        let adapter = adapter(&project, oracle);

        let outcome = adapter
            .recover_state(&project.store(), "orch-1", "schema violation", Utc::now())
            .expect("recover");

        match outcome {
            StateRecovery::Recovered(recovered) => {
                assert_eq!(recovered.step, StepName::Implement);
                assert_eq!(recovered.status, StepStatus::NotStarted);
                assert_eq!(recovered.source, RecoverySource::Heuristic);
                assert_eq!(recovered.confidence, 0.5);
            }
            other => panic!("expected recovery, got {other:?}"),
        }
    }

    #[test]
    fn answer_violating_schema_is_not_trusted() {
        let project = TestProject::initialized("orch-1");
        let oracle = Arc::new(ScriptedOracle::answering(vec![json!({
            "step": "verify",
            "status": "complete",
            "confidence": 0.95
        })]));
        let adapter = adapter(&project, oracle);

        let outcome = adapter
            .recover_state(&project.store(), "orch-1", "missing", Utc::now())
            .expect("recover");

        assert!(matches!(outcome, StateRecovery::Unresolved { .. }));
    }

    #[test]
    fn oracle_spend_is_handed_over_once() {
        let project = TestProject::initialized("orch-1");
        let oracle = Arc::new(
            ScriptedOracle::answering(vec![
                json!({"action": "retry", "reasoning": "flaky"}),
                json!({"action": "abort", "reasoning": "hopeless"}),
            ])
            .costing(0.25),
        );
        let adapter = adapter(&project, oracle);

        adapter.diagnose_failed(&failed_context(0));
        adapter.diagnose_failed(&failed_context(1));

        assert_eq!(adapter.take_spend(), 0.5);
        assert_eq!(adapter.take_spend(), 0.0);
    }

    #[test]
    fn stale_answers_map_to_resolutions() {
        let project = TestProject::initialized("orch-1");
        let oracle = Arc::new(ScriptedOracle::answering(vec![
            json!({"action": "restart_task", "reasoning": "worker hung on a prompt"}),
        ]));
        let adapter = adapter(&project, oracle);
        let context = StaleContext {
            orchestration_id: "orch-1",
            step: StepName::Implement,
            batch: None,
            workflow_id: "wf-1",
            stale_for: Duration::from_secs(20 * 60),
            transcript: Some("waiting for input"),
        };

        assert_eq!(
            adapter.diagnose_stale(&context),
            StaleResolution::RestartTask {
                reason: "worker hung on a prompt".to_string()
            }
        );
    }

    #[test]
    fn stale_oracle_failure_escalates() {
        let project = TestProject::initialized("orch-1");
        let adapter = adapter(&project, Arc::new(ScriptedOracle::failing()));
        let context = StaleContext {
            orchestration_id: "orch-1",
            step: StepName::Design,
            batch: None,
            workflow_id: "wf-1",
            stale_for: Duration::from_secs(700),
            transcript: None,
        };

        assert!(matches!(
            adapter.diagnose_stale(&context),
            StaleResolution::Escalate { .. }
        ));
    }

    #[test]
    fn exhausted_attempts_escalate_without_consulting() {
        let project = TestProject::initialized("orch-1");
        let oracle = Arc::new(ScriptedOracle::answering(vec![
            json!({"action": "retry", "reasoning": "flaky"}),
        ]));
        let adapter = adapter(&project, oracle.clone());

        assert!(matches!(
            adapter.diagnose_failed(&failed_context(2)),
            FailedResolution::Escalate { .. }
        ));
        assert_eq!(oracle.calls(), 0);
    }

    #[test]
    fn failed_oracle_falls_back_to_retry_while_attempts_remain() {
        let project = TestProject::initialized("orch-1");
        let adapter = adapter(&project, Arc::new(ScriptedOracle::failing()));

        assert!(matches!(
            adapter.diagnose_failed(&failed_context(1)),
            FailedResolution::Retry { .. }
        ));
    }

    #[test]
    fn prerequisite_answer_names_the_skill() {
        let project = TestProject::initialized("orch-1");
        let oracle = Arc::new(ScriptedOracle::answering(vec![json!({
            "action": "run_prerequisite",
            "reasoning": "plan is missing",
            "prerequisiteSkill": "analyze"
        })]));
        let adapter = adapter(&project, oracle);

        assert_eq!(
            adapter.diagnose_failed(&failed_context(0)),
            FailedResolution::RunPrerequisite {
                skill: "analyze".to_string(),
                reason: "plan is missing".to_string()
            }
        );
    }

    fn collect_sources(dir: &std::path::Path, out: &mut Vec<PathBuf>) {
        for entry in fs::read_dir(dir).expect("read src") {
            let path = entry.expect("entry").path();
            if path.is_dir() {
                collect_sources(&path, out);
            } else if path.extension().and_then(|ext| ext.to_str()) == Some("rs") {
                out.push(path);
            }
        }
    }

    #[test]
    fn oracle_is_only_reachable_through_this_module() {
        let src = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
        let allowed = [
            src.join("recovery.rs"),
            src.join("io").join("oracle.rs"),
            src.join("test_support.rs"),
        ];
        let mut files = Vec::new();
        collect_sources(&src, &mut files);
        let offenders: Vec<String> = files
            .iter()
            .filter(|path| !allowed.contains(path))
            .filter(|path| {
                let contents = fs::read_to_string(path).expect("read source");
                contents.contains("RecoveryOracle") || contents.contains(".ask(")
            })
            .map(|path| path.display().to_string())
            .collect();
        assert!(offenders.is_empty(), "oracle referenced from {offenders:?}");
    }
}
