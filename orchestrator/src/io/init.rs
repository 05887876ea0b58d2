//! Initialization helpers for `.orchestrator/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::info;

use super::config::{LoopConfig, write_config};
use super::state_store::StateStore;
use crate::state::{Execution, ExecutionConfig, OrchestrationState};

/// All canonical paths within `.orchestrator/` for a project root.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
    pub orchestrator_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runners_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub activity_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub execution_path: PathBuf,
    pub spawn_intent_path: PathBuf,
    pub spawn_lock_path: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let orchestrator_dir = root.join(".orchestrator");
        let state_dir = orchestrator_dir.join("state");
        Self {
            root: root.clone(),
            orchestrator_dir: orchestrator_dir.clone(),
            state_dir: state_dir.clone(),
            runners_dir: orchestrator_dir.join("runners"),
            workflows_dir: orchestrator_dir.join("workflows"),
            activity_dir: orchestrator_dir.join("activity"),
            backups_dir: orchestrator_dir.join("backups"),
            archive_dir: orchestrator_dir.join("archive"),
            gitignore_path: orchestrator_dir.join(".gitignore"),
            config_path: orchestrator_dir.join("config.toml"),
            state_path: state_dir.join("orchestration.json"),
            execution_path: state_dir.join("execution.json"),
            spawn_intent_path: state_dir.join("spawn_intent.json"),
            spawn_lock_path: state_dir.join("spawn.lock"),
        }
    }

    /// Resolve a configured path against the project root.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.root.join(relative)
        }
    }
}

/// Options for `init_orchestration`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub orchestration_id: String,
    pub execution: ExecutionConfig,
    /// If true, replace existing orchestration documents.
    pub force: bool,
}

/// Create `.orchestrator/` scaffolding and fresh documents in `root`.
///
/// Fails if an orchestration document already exists unless `options.force`
/// is set. An existing `config.toml` is never overwritten.
pub fn init_orchestration(
    root: &Path,
    options: &InitOptions,
    now: DateTime<Utc>,
) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(root);
    if paths.orchestrator_dir.exists() && !paths.orchestrator_dir.is_dir() {
        return Err(anyhow!(
            "orchestrator init: .orchestrator exists but is not a directory"
        ));
    }
    if paths.state_path.exists() && !options.force {
        return Err(anyhow!(
            "orchestrator init: orchestration already exists (use --force to overwrite)"
        ));
    }
    if options.orchestration_id.trim().is_empty() {
        return Err(anyhow!("orchestrator init: orchestration id must not be empty"));
    }

    for dir in [
        &paths.orchestrator_dir,
        &paths.state_dir,
        &paths.runners_dir,
        &paths.workflows_dir,
        &paths.activity_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    if !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, ORCHESTRATOR_GITIGNORE)
            .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    }
    if !paths.config_path.exists() {
        write_config(&paths.config_path, &LoopConfig::default())?;
    }

    let store = StateStore::new(&paths);
    let mut state = OrchestrationState::new(&options.orchestration_id);
    state.updated_at = Some(now);
    store.write_state(&state)?;
    store.write_execution(&Execution::new(
        &options.orchestration_id,
        options.execution.clone(),
        now,
    ))?;

    info!(
        orchestration_id = %options.orchestration_id,
        root = %root.display(),
        "orchestration initialized"
    );
    Ok(paths)
}

const ORCHESTRATOR_GITIGNORE: &str = "runners/\nworkflows/\nactivity/\nbackups/\nstate/spawn*\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExecutionStatus, StepName, StepStatus};

    fn options(force: bool) -> InitOptions {
        InitOptions {
            orchestration_id: "orch-1".to_string(),
            execution: ExecutionConfig::default(),
            force,
        }
    }

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_orchestration(temp.path(), &options(false), Utc::now()).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.runners_dir.is_dir());
        assert!(paths.workflows_dir.is_dir());
        assert!(paths.activity_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert!(paths.gitignore_path.is_file());

        let (state, execution) = StateStore::new(&paths).read().expect("read");
        assert_eq!(state.step.current, StepName::Design);
        assert_eq!(state.step.status, Some(StepStatus::NotStarted));
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(execution.orchestration_id, "orch-1");
    }

    #[test]
    fn init_without_force_refuses_existing_orchestration() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_orchestration(temp.path(), &options(false), Utc::now()).expect("init");
        let err = init_orchestration(temp.path(), &options(false), Utc::now()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        init_orchestration(temp.path(), &options(true), Utc::now()).expect("forced re-init");
    }

    #[test]
    fn init_keeps_an_edited_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_orchestration(temp.path(), &options(false), Utc::now()).expect("init");
        fs::write(&paths.config_path, "poll_interval_secs = 3\n").expect("edit config");
        init_orchestration(temp.path(), &options(true), Utc::now()).expect("re-init");
        let contents = fs::read_to_string(&paths.config_path).expect("read");
        assert_eq!(contents, "poll_interval_secs = 3\n");
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        let paths = OrchestratorPaths::new("/work/project");
        assert_eq!(
            paths.resolve(Path::new("tasks.md")),
            PathBuf::from("/work/project/tasks.md")
        );
        assert_eq!(
            paths.resolve(Path::new("/abs/tasks.md")),
            PathBuf::from("/abs/tasks.md")
        );
    }
}
