//! Test-only fixtures: a temporary project, a fixed clock and in-memory
//! fakes for the workflow registry, launcher and oracle.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tempfile::TempDir;

use crate::clock::Clock;
use crate::io::config::LoopConfig;
use crate::io::init::{InitOptions, OrchestratorPaths, init_orchestration};
use crate::io::oracle::{OracleAnswer, OracleRequest, OracleTask, RecoveryOracle};
use crate::io::state_store::StateStore;
use crate::io::workflow::{SpawnError, WorkflowHandle, WorkflowLauncher, WorkflowSource};
use crate::recovery::RecoveryAdapter;
use crate::state::{Execution, ExecutionConfig, OrchestrationState, Workflow, WorkflowStatus};
use crate::supervisor::LoopDeps;

/// The instant [`FixedClock::default`] reports.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .expect("valid fixed timestamp")
}

/// A project root in a temporary directory.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    /// A project with `.orchestrator/` scaffolding and fresh documents.
    pub fn initialized(orchestration_id: &str) -> Self {
        let project = Self::new();
        init_orchestration(
            project.root(),
            &InitOptions {
                orchestration_id: orchestration_id.to_string(),
                execution: ExecutionConfig::default(),
                force: false,
            },
            fixed_now(),
        )
        .expect("init orchestration");
        project
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> OrchestratorPaths {
        OrchestratorPaths::new(self.root())
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.paths())
    }

    /// Write `contents` to `relative`, creating parent directories.
    pub fn write_file(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn read_file(&self, relative: &str) -> String {
        fs::read_to_string(self.root().join(relative)).expect("read file")
    }

    pub fn write_raw_state(&self, contents: &str) {
        fs::write(self.paths().state_path, contents).expect("write state");
    }

    pub fn read_raw_execution(&self) -> String {
        fs::read_to_string(self.paths().execution_path).expect("read execution")
    }

    pub fn read_documents(&self) -> (OrchestrationState, Execution) {
        self.store().read().expect("documents readable")
    }

    pub fn write_documents(&self, state: &OrchestrationState, execution: &Execution) {
        let store = self.store();
        store.write_state(state).expect("write state");
        store.write_execution(execution).expect("write execution");
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += chrono::TimeDelta::from_std(by).expect("delta in range");
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::at(fixed_now())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// A workflow record with no activity recorded.
pub fn workflow(id: &str, orchestration_id: &str, status: WorkflowStatus) -> Workflow {
    Workflow {
        id: id.to_string(),
        orchestration_id: orchestration_id.to_string(),
        skill: "design".to_string(),
        status,
        session_id: None,
        last_activity_at: None,
        started_at: None,
        pid: None,
        cost_usd: None,
    }
}

/// In-memory workflow registry.
#[derive(Debug, Default)]
pub struct FakeWorkflows {
    records: Mutex<BTreeMap<String, Workflow>>,
}

impl FakeWorkflows {
    pub fn insert(&self, workflow: Workflow) {
        self.records
            .lock()
            .expect("workflows lock")
            .insert(workflow.id.clone(), workflow);
    }

    pub fn set_status(&self, workflow_id: &str, status: WorkflowStatus) {
        if let Some(record) = self
            .records
            .lock()
            .expect("workflows lock")
            .get_mut(workflow_id)
        {
            record.status = status;
        }
    }
}

impl WorkflowSource for FakeWorkflows {
    fn get(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        Ok(self
            .records
            .lock()
            .expect("workflows lock")
            .get(workflow_id)
            .cloned())
    }

    fn active_for(&self, orchestration_id: &str) -> Result<Option<Workflow>> {
        Ok(self
            .records
            .lock()
            .expect("workflows lock")
            .values()
            .filter(|w| w.orchestration_id == orchestration_id && w.is_active())
            .max_by_key(|w| w.started_at)
            .cloned())
    }

    fn transcript_excerpt(&self, workflow_id: &str, _max_bytes: usize) -> Result<Option<String>> {
        Ok(self
            .records
            .lock()
            .expect("workflows lock")
            .get(workflow_id)
            .map(|w| format!("transcript of {}", w.id)))
    }
}

#[derive(Debug, Default)]
struct LauncherLog {
    spawned: u32,
    skills: Vec<String>,
    contexts: Vec<Option<String>>,
    cancelled: Vec<String>,
    fail_next: Option<String>,
    already_running: Option<String>,
    delay: Option<Duration>,
}

/// Launcher that records calls and registers each spawn as a running
/// workflow `wf-N` in the shared [`FakeWorkflows`].
#[derive(Debug)]
pub struct FakeLauncher {
    orchestration_id: String,
    workflows: Arc<FakeWorkflows>,
    log: Mutex<LauncherLog>,
}

impl FakeLauncher {
    pub fn new(orchestration_id: &str, workflows: Arc<FakeWorkflows>) -> Self {
        Self {
            orchestration_id: orchestration_id.to_string(),
            workflows,
            log: Mutex::new(LauncherLog::default()),
        }
    }

    pub fn fail_next(&self, message: &str) {
        self.log.lock().expect("launcher lock").fail_next = Some(message.to_string());
    }

    pub fn report_already_running(&self, workflow_id: &str) {
        self.log.lock().expect("launcher lock").already_running = Some(workflow_id.to_string());
    }

    /// Make every launch take `delay` before it registers the workflow.
    pub fn set_delay(&self, delay: Duration) {
        self.log.lock().expect("launcher lock").delay = Some(delay);
    }

    pub fn skills(&self) -> Vec<String> {
        self.log.lock().expect("launcher lock").skills.clone()
    }

    pub fn contexts(&self) -> Vec<Option<String>> {
        self.log.lock().expect("launcher lock").contexts.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.log.lock().expect("launcher lock").cancelled.clone()
    }
}

impl WorkflowLauncher for FakeLauncher {
    fn spawn(&self, skill: &str, context: Option<&str>) -> Result<WorkflowHandle, SpawnError> {
        let (id, delay) = {
            let mut log = self.log.lock().expect("launcher lock");
            log.skills.push(skill.to_string());
            log.contexts.push(context.map(str::to_string));
            if let Some(message) = log.fail_next.take() {
                return Err(SpawnError::Launch(anyhow!(message)));
            }
            if let Some(workflow_id) = log.already_running.take() {
                return Err(SpawnError::AlreadyRunning { workflow_id });
            }
            log.spawned += 1;
            (format!("wf-{}", log.spawned), log.delay)
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let session_id = format!("session-{id}");
        self.workflows.insert(Workflow {
            skill: skill.to_string(),
            session_id: Some(session_id.clone()),
            ..workflow(&id, &self.orchestration_id, WorkflowStatus::Running)
        });
        Ok(WorkflowHandle {
            id,
            session_id: Some(session_id),
        })
    }

    fn cancel(&self, workflow_id: &str) -> Result<()> {
        self.log
            .lock()
            .expect("launcher lock")
            .cancelled
            .push(workflow_id.to_string());
        self.workflows.set_status(workflow_id, WorkflowStatus::Failed);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OracleLog {
    answers: VecDeque<Value>,
    tasks: Vec<OracleTask>,
    cost_per_answer: Option<f64>,
}

/// Oracle that replays canned answers in order, then fails.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    log: Mutex<OracleLog>,
}

impl ScriptedOracle {
    pub fn answering(answers: Vec<Value>) -> Self {
        Self {
            log: Mutex::new(OracleLog {
                answers: answers.into(),
                ..OracleLog::default()
            }),
        }
    }

    /// Report `cost_usd` with every answer.
    pub fn costing(self, cost_usd: f64) -> Self {
        self.log.lock().expect("oracle lock").cost_per_answer = Some(cost_usd);
        self
    }

    /// An oracle that is never reachable.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.log.lock().expect("oracle lock").tasks.len()
    }

    pub fn tasks(&self) -> Vec<OracleTask> {
        self.log.lock().expect("oracle lock").tasks.clone()
    }
}

impl RecoveryOracle for ScriptedOracle {
    fn ask(&self, request: &OracleRequest) -> Result<OracleAnswer> {
        let mut log = self.log.lock().expect("oracle lock");
        log.tasks.push(request.task);
        let value = log
            .answers
            .pop_front()
            .ok_or_else(|| anyhow!("oracle unavailable"))?;
        Ok(OracleAnswer {
            value,
            cost_usd: log.cost_per_answer,
        })
    }
}

/// The full set of fakes behind a [`LoopDeps`].
pub struct Fakes {
    pub orchestration_id: String,
    pub workflows: Arc<FakeWorkflows>,
    pub launcher: Arc<FakeLauncher>,
    pub oracle: Arc<ScriptedOracle>,
    pub clock: Arc<FixedClock>,
    pub config: LoopConfig,
}

impl Fakes {
    /// Fakes with an unreachable oracle and a zero poll interval.
    pub fn new(orchestration_id: &str) -> Self {
        let workflows = Arc::new(FakeWorkflows::default());
        let launcher = Arc::new(FakeLauncher::new(orchestration_id, workflows.clone()));
        let config = LoopConfig {
            poll_interval_secs: 0,
            max_iterations: 10,
            ..LoopConfig::default()
        };
        Self {
            orchestration_id: orchestration_id.to_string(),
            workflows,
            launcher,
            oracle: Arc::new(ScriptedOracle::failing()),
            clock: Arc::new(FixedClock::default()),
            config,
        }
    }

    pub fn with_oracle_answers(mut self, answers: Vec<Value>) -> Self {
        self.oracle = Arc::new(ScriptedOracle::answering(answers));
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn deps(&self, project: &TestProject) -> LoopDeps {
        let paths = project.paths();
        let recovery = RecoveryAdapter::new(
            self.oracle.clone(),
            self.config.oracle.clone(),
            paths.resolve(&self.config.artifacts_dir),
            paths.resolve(&self.config.tasks_file),
        )
        .expect("recovery adapter");
        LoopDeps::new(
            self.orchestration_id.clone(),
            paths,
            self.config.clone(),
            self.workflows.clone(),
            self.launcher.clone(),
            recovery,
            self.clock.clone(),
        )
    }
}
