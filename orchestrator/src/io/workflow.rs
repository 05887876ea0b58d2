//! Worker sessions: lookup and launch.
//!
//! The [`WorkflowSource`] and [`WorkflowLauncher`] traits decouple the loop
//! from how workers actually run. The file-backed implementations keep one
//! JSON record per workflow under `.orchestrator/workflows/`; workers update
//! their own record while they run. Tests use in-memory fakes.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use super::fs_util::write_json_atomic;
use super::process::{is_pid_alive, terminate};
use crate::clock::Clock;
use crate::state::{Workflow, WorkflowStatus};

/// Read side of the workflow registry.
pub trait WorkflowSource: Send + Sync {
    /// Look up a workflow by id. `Ok(None)` when no such workflow is known.
    fn get(&self, workflow_id: &str) -> Result<Option<Workflow>>;

    /// The most recently started active workflow for an orchestration.
    fn active_for(&self, orchestration_id: &str) -> Result<Option<Workflow>>;

    /// Tail of the workflow's output, at most `max_bytes`.
    fn transcript_excerpt(&self, workflow_id: &str, max_bytes: usize) -> Result<Option<String>>;
}

/// Launch failures the caller must tell apart.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// Another workflow already occupies the orchestration.
    #[error("workflow {workflow_id} is already running")]
    AlreadyRunning { workflow_id: String },
    #[error(transparent)]
    Launch(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowHandle {
    pub id: String,
    pub session_id: Option<String>,
}

/// Write side of the workflow registry, bound to one orchestration.
pub trait WorkflowLauncher: Send + Sync {
    fn spawn(&self, skill: &str, context: Option<&str>) -> Result<WorkflowHandle, SpawnError>;

    /// Stop a workflow and mark it failed. Unknown ids are not an error.
    fn cancel(&self, workflow_id: &str) -> Result<()>;
}

/// Workflow records stored as `<dir>/<id>.json`, logs as `<dir>/<id>.log`.
#[derive(Debug, Clone)]
pub struct FileWorkflowStore {
    dir: PathBuf,
}

impl FileWorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.json"))
    }

    pub fn log_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.log"))
    }

    pub fn write(&self, workflow: &Workflow) -> Result<()> {
        write_json_atomic(&self.record_path(&workflow.id), workflow)
    }

    fn read_record(&self, path: &Path) -> Result<Workflow> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let workflow: Workflow = serde_json::from_str(&contents)
            .with_context(|| format!("parse workflow {}", path.display()))?;
        Ok(reconcile_liveness(workflow))
    }
}

/// A record still claiming to be active whose process is gone is reported
/// failed; the worker died without updating it.
fn reconcile_liveness(mut workflow: Workflow) -> Workflow {
    if workflow.is_active()
        && let Some(pid) = workflow.pid
        && !is_pid_alive(pid)
    {
        debug!(workflow_id = %workflow.id, pid, "worker process gone, reporting failed");
        workflow.status = WorkflowStatus::Failed;
    }
    workflow
}

impl WorkflowSource for FileWorkflowStore {
    fn get(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        let path = self.record_path(workflow_id);
        if !path.exists() {
            return Ok(None);
        }
        self.read_record(&path).map(Some)
    }

    fn active_for(&self, orchestration_id: &str) -> Result<Option<Workflow>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("read directory {}", self.dir.display()))?;
        let mut newest: Option<Workflow> = None;
        for entry in entries {
            let path = entry.context("read directory entry")?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let workflow = match self.read_record(&path) {
                Ok(workflow) => workflow,
                Err(err) => {
                    warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable workflow record");
                    continue;
                }
            };
            if workflow.orchestration_id != orchestration_id || !workflow.is_active() {
                continue;
            }
            if newest
                .as_ref()
                .is_none_or(|current| workflow.started_at > current.started_at)
            {
                newest = Some(workflow);
            }
        }
        Ok(newest)
    }

    fn transcript_excerpt(&self, workflow_id: &str, max_bytes: usize) -> Result<Option<String>> {
        let path = self.log_path(workflow_id);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        let start = len.saturating_sub(max_bytes as u64);
        file.seek(SeekFrom::Start(start))
            .with_context(|| format!("seek {}", path.display()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

/// Starts each workflow as a detached worker process.
///
/// The command is `[worker].command` followed by one prompt argument: the
/// skill invocation (`/<skill>`) plus the optional context. The worker learns
/// its record path from `ORCHESTRATOR_WORKFLOW_RECORD` and is expected to keep
/// it current, including `costUsd` once it knows its spend.
pub struct CommandLauncher {
    store: FileWorkflowStore,
    orchestration_id: String,
    workdir: PathBuf,
    command: Vec<String>,
    clock: Arc<dyn Clock>,
}

impl CommandLauncher {
    pub fn new(
        store: FileWorkflowStore,
        orchestration_id: impl Into<String>,
        workdir: impl Into<PathBuf>,
        command: Vec<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            orchestration_id: orchestration_id.into(),
            workdir: workdir.into(),
            command,
            clock,
        }
    }

    fn start_worker(
        &self,
        program: &str,
        args: &[String],
        skill: &str,
        context: Option<&str>,
        workflow_id: &str,
    ) -> Result<Child> {
        let log_path = self.store.log_path(workflow_id);
        let log = File::create(&log_path)
            .with_context(|| format!("create worker log {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("clone worker log {}", log_path.display()))?;

        let mut prompt = format!("/{skill}");
        if let Some(context) = context {
            prompt.push_str("\n\n");
            prompt.push_str(context);
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&prompt)
            .current_dir(&self.workdir)
            .env("ORCHESTRATOR_ID", &self.orchestration_id)
            .env("ORCHESTRATOR_WORKFLOW_ID", workflow_id)
            .env(
                "ORCHESTRATOR_WORKFLOW_RECORD",
                self.store.record_path(workflow_id),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        cmd.spawn()
            .with_context(|| format!("spawn worker {program} for skill {skill}"))
    }

    /// Mark a record whose worker never got going as failed.
    fn abandon(&self, workflow: &mut Workflow) {
        workflow.status = WorkflowStatus::Failed;
        if let Err(err) = self.store.write(workflow) {
            warn!(workflow_id = %workflow.id, err = %format!("{err:#}"), "failed to mark workflow failed");
        }
    }
}

impl WorkflowLauncher for CommandLauncher {
    #[instrument(skip_all, fields(orchestration_id = %self.orchestration_id, skill))]
    fn spawn(&self, skill: &str, context: Option<&str>) -> Result<WorkflowHandle, SpawnError> {
        if let Some(active) = self.store.active_for(&self.orchestration_id)? {
            return Err(SpawnError::AlreadyRunning {
                workflow_id: active.id,
            });
        }

        let (program, args) = self
            .command
            .split_first()
            .context("worker command is empty")?;
        let workflow_id = uuid::Uuid::new_v4().to_string();
        let record_path = self.store.record_path(&workflow_id);
        let log_path = self.store.log_path(&workflow_id);
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        // The record exists before the process does, so a running worker is
        // always visible to `active_for`.
        let now = self.clock.now();
        let mut workflow = Workflow {
            id: workflow_id.clone(),
            orchestration_id: self.orchestration_id.clone(),
            skill: skill.to_string(),
            status: WorkflowStatus::Running,
            session_id: None,
            last_activity_at: Some(now),
            started_at: Some(now),
            pid: None,
            cost_usd: None,
        };
        self.store
            .write(&workflow)
            .with_context(|| format!("write workflow record {}", record_path.display()))?;

        let mut child = match self.start_worker(program, args, skill, context, &workflow_id) {
            Ok(child) => child,
            Err(err) => {
                self.abandon(&mut workflow);
                return Err(err.into());
            }
        };
        let pid = child.id();
        // The worker may already have updated its record; keep what it wrote.
        if let Ok(Some(current)) = self.store.get(&workflow_id) {
            workflow = current;
        }
        workflow.pid = Some(pid);
        if let Err(err) = self.store.write(&workflow) {
            warn!(workflow_id = %workflow_id, pid, "worker record update failed, stopping worker");
            if let Err(kill_err) = child.kill() {
                warn!(workflow_id = %workflow_id, err = %kill_err, "kill worker failed");
            }
            let _ = child.wait();
            self.abandon(&mut workflow);
            return Err(err
                .context(format!("record pid for workflow {workflow_id}"))
                .into());
        }
        info!(workflow_id = %workflow_id, pid, "worker started");

        // Reap the child so it never lingers as a zombie, and settle its record
        // if the worker exited without doing so.
        let store = self.store.clone();
        let reaped_id = workflow_id.clone();
        thread::spawn(move || {
            let success = match child.wait() {
                Ok(status) => status.success(),
                Err(err) => {
                    warn!(workflow_id = %reaped_id, err = %err, "wait for worker failed");
                    false
                }
            };
            if let Err(err) = settle_exited(&store, &reaped_id, success) {
                warn!(workflow_id = %reaped_id, err = %format!("{err:#}"), "failed to settle worker record");
            }
        });

        Ok(WorkflowHandle {
            id: workflow_id,
            session_id: None,
        })
    }

    #[instrument(skip_all, fields(workflow_id))]
    fn cancel(&self, workflow_id: &str) -> Result<()> {
        let Some(mut workflow) = self.store.get(workflow_id)? else {
            debug!("cancel: unknown workflow");
            return Ok(());
        };
        if let Some(pid) = workflow.pid
            && workflow.is_active()
        {
            terminate(pid)?;
        }
        if workflow.is_active() {
            workflow.status = WorkflowStatus::Failed;
        }
        self.store.write(&workflow)?;
        info!("workflow cancelled");
        Ok(())
    }
}

fn settle_exited(store: &FileWorkflowStore, workflow_id: &str, success: bool) -> Result<()> {
    let path = store.record_path(workflow_id);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let mut workflow: Workflow = serde_json::from_str(&contents)
        .with_context(|| format!("parse workflow {}", path.display()))?;
    if !workflow.is_active() {
        return Ok(());
    }
    workflow.status = if success {
        WorkflowStatus::Completed
    } else {
        WorkflowStatus::Failed
    };
    store.write(&workflow)
}
