//! Orchestration document storage with schema validation.
//!
//! Reads distinguish "the documents are unusable" ([`CorruptionError`], which
//! routes to recovery) from ordinary I/O failures on writes (`anyhow`).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::fs_util::write_json_atomic;
use super::init::OrchestratorPaths;
use super::schema::{ORCHESTRATION_STATE_SCHEMA, parse_schema, validate_instance};
use crate::state::{Execution, ExecutionConfig, OrchestrationState};

static STATE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    parse_schema(ORCHESTRATION_STATE_SCHEMA).expect("embedded state schema is valid json")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    State,
    Execution,
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Document::State => f.write_str("orchestration state"),
            Document::Execution => f.write_str("execution record"),
        }
    }
}

/// A document exists but cannot be trusted, or is missing.
#[derive(Debug, thiserror::Error)]
pub enum CorruptionError {
    #[error("{document} missing at {}", path.display())]
    Missing { document: Document, path: PathBuf },
    #[error("{document} unreadable at {}: {detail}", path.display())]
    Unreadable {
        document: Document,
        path: PathBuf,
        detail: String,
    },
    #[error("{document} is not valid json: {detail}")]
    Malformed { document: Document, detail: String },
    #[error("{document} violates its schema: {detail}")]
    SchemaViolation { document: Document, detail: String },
}

impl CorruptionError {
    pub fn document(&self) -> Document {
        match self {
            CorruptionError::Missing { document, .. }
            | CorruptionError::Unreadable { document, .. }
            | CorruptionError::Malformed { document, .. }
            | CorruptionError::SchemaViolation { document, .. } => *document,
        }
    }
}

/// Run settings kept from an execution record that no longer parses.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionCarryOver {
    pub config: ExecutionConfig,
    pub started_at: DateTime<Utc>,
    pub total_cost_usd: f64,
}

impl ExecutionCarryOver {
    /// A fresh execution record that keeps the run's settings and spend.
    pub fn into_execution(self, orchestration_id: &str) -> Execution {
        let mut execution = Execution::new(orchestration_id, self.config, self.started_at);
        execution.total_cost_usd = self.total_cost_usd;
        execution
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    execution_path: PathBuf,
    backups_dir: PathBuf,
    archive_dir: PathBuf,
    spawn_intent_path: PathBuf,
}

impl StateStore {
    pub fn new(paths: &OrchestratorPaths) -> Self {
        Self {
            state_path: paths.state_path.clone(),
            execution_path: paths.execution_path.clone(),
            backups_dir: paths.backups_dir.clone(),
            archive_dir: paths.archive_dir.clone(),
            spawn_intent_path: paths.spawn_intent_path.clone(),
        }
    }

    /// True when an orchestration document is present at all.
    pub fn exists(&self) -> bool {
        self.state_path.exists()
    }

    /// Read both documents, validating the state document against its schema.
    #[instrument(skip_all)]
    pub fn read(&self) -> Result<(OrchestrationState, Execution), CorruptionError> {
        let state = self.read_state()?;
        let execution = self.read_execution()?;
        debug!(
            step = state.step.current.as_str(),
            status = ?execution.status,
            "documents loaded"
        );
        Ok((state, execution))
    }

    pub fn read_state(&self) -> Result<OrchestrationState, CorruptionError> {
        let value = read_value(Document::State, &self.state_path)?;
        validate_instance(&value, &STATE_SCHEMA).map_err(|err| {
            CorruptionError::SchemaViolation {
                document: Document::State,
                detail: format!("{err:#}"),
            }
        })?;
        serde_json::from_value(value).map_err(|err| CorruptionError::SchemaViolation {
            document: Document::State,
            detail: err.to_string(),
        })
    }

    pub fn read_execution(&self) -> Result<Execution, CorruptionError> {
        let value = read_value(Document::Execution, &self.execution_path)?;
        serde_json::from_value(value).map_err(|err| CorruptionError::SchemaViolation {
            document: Document::Execution,
            detail: err.to_string(),
        })
    }

    /// Raw state document text, for recovery prompts. `None` when unreadable.
    pub fn read_raw_state(&self) -> Option<String> {
        fs::read_to_string(&self.state_path).ok()
    }

    pub fn write_state(&self, state: &OrchestrationState) -> Result<()> {
        debug!(
            step = state.step.current.as_str(),
            status = ?state.step.status,
            "writing orchestration state"
        );
        write_json_atomic(&self.state_path, state)
    }

    pub fn write_execution(&self, execution: &Execution) -> Result<()> {
        debug!(status = ?execution.status, "writing execution record");
        write_json_atomic(&self.execution_path, execution)
    }

    /// Config, start time and spend from the newest execution record that
    /// still has them: the current file first, then backups newest first.
    ///
    /// Only loose JSON is required, so a record that fails to parse as a whole
    /// still yields its settings.
    pub fn salvage_execution(&self, orchestration_id: &str) -> Option<ExecutionCarryOver> {
        self.execution_candidates()
            .into_iter()
            .filter_map(|path| read_loose(&path))
            .filter(|value| {
                value.get("orchestrationId").and_then(Value::as_str) == Some(orchestration_id)
            })
            .find_map(|value| {
                let started_at = value
                    .get("startedAt")
                    .cloned()
                    .and_then(|raw| serde_json::from_value(raw).ok())?;
                let config = value
                    .get("config")
                    .cloned()
                    .and_then(|raw| serde_json::from_value(raw).ok())
                    .unwrap_or_default();
                let total_cost_usd = value
                    .get("totalCostUsd")
                    .and_then(Value::as_f64)
                    .filter(|cost| cost.is_finite() && *cost >= 0.0)
                    .unwrap_or(0.0);
                Some(ExecutionCarryOver {
                    config,
                    started_at,
                    total_cost_usd,
                })
            })
    }

    /// The orchestration id named by any surviving document or backup.
    pub fn salvage_orchestration_id(&self) -> Option<String> {
        std::iter::once(self.state_path.clone())
            .chain(self.execution_candidates())
            .chain(self.backups_ending_with("-orchestration.json"))
            .filter_map(|path| read_loose(&path))
            .find_map(|value| {
                value
                    .get("orchestrationId")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
            })
    }

    fn execution_candidates(&self) -> Vec<PathBuf> {
        std::iter::once(self.execution_path.clone())
            .chain(self.backups_ending_with("-execution.json"))
            .collect()
    }

    /// Backup files with the given suffix, newest first.
    fn backups_ending_with(&self, suffix: &str) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.backups_dir) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(suffix))
            })
            .collect();
        paths.sort();
        paths.reverse();
        paths
    }

    /// Copy whichever documents exist into `backups/`, timestamped.
    #[instrument(skip_all)]
    pub fn backup(&self, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.backups_dir)
            .with_context(|| format!("create directory {}", self.backups_dir.display()))?;
        let stamp = timestamp(now);
        let mut written = Vec::new();
        for source in [&self.state_path, &self.execution_path] {
            if !source.exists() {
                continue;
            }
            let name = file_name(source)?;
            let target = self.backups_dir.join(format!("{stamp}-{name}"));
            fs::copy(source, &target).with_context(|| {
                format!("back up {} to {}", source.display(), target.display())
            })?;
            written.push(target);
        }
        info!(files = written.len(), "state backed up");
        Ok(written)
    }

    /// Move both documents into `archive/<id>-<timestamp>/`.
    #[instrument(skip_all, fields(orchestration_id = orchestration_id))]
    pub fn archive(&self, orchestration_id: &str, now: DateTime<Utc>) -> Result<PathBuf> {
        let target_dir = self
            .archive_dir
            .join(format!("{orchestration_id}-{}", timestamp(now)));
        fs::create_dir_all(&target_dir)
            .with_context(|| format!("create directory {}", target_dir.display()))?;
        for source in [&self.state_path, &self.execution_path] {
            if !source.exists() {
                warn!(path = %source.display(), "nothing to archive");
                continue;
            }
            let target = target_dir.join(file_name(source)?);
            fs::rename(source, &target).with_context(|| {
                format!("archive {} to {}", source.display(), target.display())
            })?;
        }
        if self.spawn_intent_path.exists() {
            fs::remove_file(&self.spawn_intent_path).with_context(|| {
                format!("remove {}", self.spawn_intent_path.display())
            })?;
        }
        info!(archive = %target_dir.display(), "orchestration archived");
        Ok(target_dir)
    }
}

fn read_value(document: Document, path: &Path) -> Result<Value, CorruptionError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(CorruptionError::Missing {
                document,
                path: path.to_path_buf(),
            });
        }
        Err(err) => {
            return Err(CorruptionError::Unreadable {
                document,
                path: path.to_path_buf(),
                detail: err.to_string(),
            });
        }
    };
    serde_json::from_str(&contents).map_err(|err| CorruptionError::Malformed {
        document,
        detail: err.to_string(),
    })
}

fn read_loose(path: &Path) -> Option<Value> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("path missing file name {}", path.display()))
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExecutionConfig, StepName, StepStatus};

    fn store() -> (tempfile::TempDir, OrchestratorPaths, StateStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = OrchestratorPaths::new(temp.path());
        let store = StateStore::new(&paths);
        (temp, paths, store)
    }

    fn write_documents(store: &StateStore) -> (OrchestrationState, Execution) {
        let mut state = OrchestrationState::new("orch-1");
        state.enter_step(StepName::Analyze);
        let mut execution = Execution::new("orch-1", ExecutionConfig::default(), Utc::now());
        execution.current_phase = StepName::Analyze;
        store.write_state(&state).expect("write state");
        store.write_execution(&execution).expect("write execution");
        (state, execution)
    }

    #[test]
    fn documents_round_trip() {
        let (_temp, _paths, store) = store();
        let (state, execution) = write_documents(&store);
        let (read_state, read_execution) = store.read().expect("read");
        assert_eq!(read_state, state);
        assert_eq!(read_execution, execution);
    }

    #[test]
    fn truncated_state_is_malformed() {
        let (_temp, paths, store) = store();
        write_documents(&store);
        fs::write(&paths.state_path, "{\"orchestrationId\": \"orch-1\", \"st").expect("truncate");
        let err = store.read().expect_err("corrupt");
        assert!(matches!(err, CorruptionError::Malformed { .. }));
        assert_eq!(err.document(), Document::State);
    }

    #[test]
    fn unknown_step_name_violates_schema() {
        let (_temp, paths, store) = store();
        write_documents(&store);
        let mut value: Value =
            serde_json::from_str(&fs::read_to_string(&paths.state_path).expect("read"))
                .expect("parse");
        value["step"]["current"] = Value::String("deploy".to_string());
        fs::write(&paths.state_path, value.to_string()).expect("write");
        let err = store.read().expect_err("corrupt");
        assert!(matches!(err, CorruptionError::SchemaViolation { .. }));
    }

    #[test]
    fn unrecognised_step_status_still_loads() {
        let (_temp, paths, store) = store();
        write_documents(&store);
        let mut value: Value =
            serde_json::from_str(&fs::read_to_string(&paths.state_path).expect("read"))
                .expect("parse");
        value["step"]["status"] = Value::String("paused_by_human".to_string());
        fs::write(&paths.state_path, value.to_string()).expect("write");
        let (state, _) = store.read().expect("read");
        assert_eq!(state.step.status, Some(StepStatus::Unknown));
    }

    #[test]
    fn missing_execution_is_reported() {
        let (_temp, paths, store) = store();
        write_documents(&store);
        fs::remove_file(&paths.execution_path).expect("remove");
        let err = store.read().expect_err("missing");
        assert!(matches!(
            err,
            CorruptionError::Missing {
                document: Document::Execution,
                ..
            }
        ));
    }

    #[test]
    fn backup_copies_existing_documents() {
        let (_temp, paths, store) = store();
        write_documents(&store);
        let written = store.backup(Utc::now()).expect("backup");
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|path| path.starts_with(&paths.backups_dir)));
        assert!(paths.state_path.exists());
    }

    #[test]
    fn archive_moves_documents_away() {
        let (_temp, paths, store) = store();
        write_documents(&store);
        let dir = store.archive("orch-1", Utc::now()).expect("archive");
        assert!(dir.join("orchestration.json").is_file());
        assert!(dir.join("execution.json").is_file());
        assert!(!paths.state_path.exists());
        assert!(!store.exists());
    }

    #[test]
    fn salvage_keeps_settings_from_a_record_that_no_longer_parses() {
        let (_temp, paths, store) = store();
        let config = ExecutionConfig {
            auto_merge: true,
            ..ExecutionConfig::default()
        };
        let started = Utc::now() - chrono::TimeDelta::hours(3);
        let mut execution = Execution::new("orch-1", config.clone(), started);
        execution.total_cost_usd = 7.5;
        store.write_execution(&execution).expect("write");
        let mut value: Value =
            serde_json::from_str(&fs::read_to_string(&paths.execution_path).expect("read"))
                .expect("parse");
        value["status"] = Value::String("exploded".to_string());
        fs::write(&paths.execution_path, value.to_string()).expect("write");
        assert!(store.read_execution().is_err());

        let carried = store.salvage_execution("orch-1").expect("salvaged");
        assert_eq!(carried.config, config);
        assert_eq!(carried.started_at, started);
        assert_eq!(carried.total_cost_usd, 7.5);
        assert_eq!(store.salvage_execution("orch-2"), None);
    }

    #[test]
    fn salvage_falls_back_to_the_newest_backup() {
        let (_temp, paths, store) = store();
        let (_, execution) = write_documents(&store);
        store.backup(Utc::now()).expect("backup");
        fs::write(&paths.execution_path, "{ not json").expect("corrupt");
        fs::write(&paths.state_path, "{ not json").expect("corrupt");

        let carried = store.salvage_execution("orch-1").expect("salvaged");
        assert_eq!(carried.started_at, execution.started_at);
        assert_eq!(store.salvage_orchestration_id().as_deref(), Some("orch-1"));
    }
}
