//! Race-safe workflow spawning.
//!
//! Every spawn goes through [`Spawner::spawn_with_intent`]:
//!
//! 1. take the exclusive `spawn.lock`
//! 2. skip when a fresh spawn intent exists or a workflow is already active
//! 3. persist the intent and release the lock
//! 4. launch
//! 5. clear the intent, whatever the launch did
//!
//! The intent is advisory. It only excludes spawners that follow this path,
//! and it expires after a short TTL so a crashed spawner cannot hold it.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::core::staleness::stale_for;
use crate::io::fs_util::write_json_atomic;
use crate::io::init::OrchestratorPaths;
use crate::io::workflow::{SpawnError, WorkflowHandle, WorkflowLauncher, WorkflowSource};

/// Spawn claim persisted between the check and the launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnIntent {
    pub orchestration_id: String,
    pub skill: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another spawner claimed the orchestration less than a TTL ago.
    IntentHeld { skill: String, age: Duration },
    AlreadyActive { workflow_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned(WorkflowHandle),
    Skipped(SkipReason),
    /// The launcher itself found a workflow running.
    AlreadyRunning { workflow_id: String },
}

pub struct Spawner {
    orchestration_id: String,
    intent_path: PathBuf,
    lock_path: PathBuf,
    intent_ttl: Duration,
    workflows: Arc<dyn WorkflowSource>,
    launcher: Arc<dyn WorkflowLauncher>,
    clock: Arc<dyn Clock>,
}

impl Spawner {
    pub fn new(
        paths: &OrchestratorPaths,
        orchestration_id: impl Into<String>,
        intent_ttl: Duration,
        workflows: Arc<dyn WorkflowSource>,
        launcher: Arc<dyn WorkflowLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orchestration_id: orchestration_id.into(),
            intent_path: paths.spawn_intent_path.clone(),
            lock_path: paths.spawn_lock_path.clone(),
            intent_ttl,
            workflows,
            launcher,
            clock,
        }
    }

    #[instrument(skip_all, fields(orchestration_id = %self.orchestration_id, skill = skill))]
    pub fn spawn_with_intent(&self, skill: &str, context: Option<&str>) -> Result<SpawnOutcome> {
        if let Some(skip) = self.claim(skill)? {
            debug!(reason = ?skip, "spawn skipped");
            return Ok(SpawnOutcome::Skipped(skip));
        }

        let launched = self.launcher.spawn(skill, context);
        self.clear_intent();

        match launched {
            Ok(handle) => {
                info!(workflow_id = %handle.id, "workflow spawned");
                Ok(SpawnOutcome::Spawned(handle))
            }
            Err(SpawnError::AlreadyRunning { workflow_id }) => {
                info!(workflow_id = %workflow_id, "launcher reports a workflow already running");
                Ok(SpawnOutcome::AlreadyRunning { workflow_id })
            }
            Err(SpawnError::Launch(err)) => Err(err.context(format!("launch {skill} workflow"))),
        }
    }

    /// Check-and-set of the intent under the lock. `Some` means do not spawn.
    fn claim(&self, skill: &str) -> Result<Option<SkipReason>> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("open {}", self.lock_path.display()))?;
        FileExt::lock_exclusive(&lock_file)
            .with_context(|| format!("lock {}", self.lock_path.display()))?;

        let now = self.clock.now();
        if let Some(intent) = self.read_intent() {
            let age = stale_for(now, intent.timestamp);
            if age < self.intent_ttl {
                return Ok(Some(SkipReason::IntentHeld {
                    skill: intent.skill,
                    age,
                }));
            }
            debug!(age_secs = age.as_secs(), "ignoring expired spawn intent");
        }

        if let Some(active) = self.workflows.active_for(&self.orchestration_id)? {
            return Ok(Some(SkipReason::AlreadyActive {
                workflow_id: active.id,
            }));
        }

        write_json_atomic(
            &self.intent_path,
            &SpawnIntent {
                orchestration_id: self.orchestration_id.clone(),
                skill: skill.to_string(),
                timestamp: now,
            },
        )?;
        // The lock is released when `lock_file` drops.
        Ok(None)
    }

    fn read_intent(&self) -> Option<SpawnIntent> {
        let contents = match fs::read_to_string(&self.intent_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(err = %err, "unreadable spawn intent, ignoring");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(intent) => Some(intent),
            Err(err) => {
                warn!(err = %err, "malformed spawn intent, ignoring");
                None
            }
        }
    }

    fn clear_intent(&self) {
        match fs::remove_file(&self.intent_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(err = %err, "failed to clear spawn intent"),
        }
    }
}
