//! Runner records (`.orchestrator/runners/<id>.json`).
//!
//! One record per live control loop. A record whose process is gone is an
//! orphan left by a crash and is removed at the next start. Claims and
//! removals for an id happen under its exclusive `<id>.lock`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::fs_util::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerState {
    pub orchestration_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunnerRecords {
    dir: PathBuf,
}

impl RunnerRecords {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, orchestration_id: &str) -> PathBuf {
        self.dir.join(format!("{orchestration_id}.json"))
    }

    /// Exclusive lock for one id, released when the file drops.
    fn lock(&self, orchestration_id: &str) -> Result<File> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create directory {}", self.dir.display()))?;
        let path = self.dir.join(format!("{orchestration_id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        FileExt::lock_exclusive(&file).with_context(|| format!("lock {}", path.display()))?;
        Ok(file)
    }

    pub fn read(&self, orchestration_id: &str) -> Result<Option<RunnerState>> {
        let path = self.path(orchestration_id);
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    pub fn list(&self) -> Result<Vec<RunnerState>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in
            fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))?
        {
            let path = entry.context("read directory entry")?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable runner record"),
            }
        }
        records.sort_by(|a, b| a.orchestration_id.cmp(&b.orchestration_id));
        Ok(records)
    }

    /// Remove records whose process is dead. Returns the removed records.
    pub fn reconcile_orphans(&self, is_alive: impl Fn(u32) -> bool) -> Result<Vec<RunnerState>> {
        let mut removed = Vec::new();
        for record in self.list()? {
            if is_alive(record.pid) {
                continue;
            }
            let _lock = self.lock(&record.orchestration_id)?;
            // A new runner may have claimed the id since the listing.
            match self.read(&record.orchestration_id)? {
                Some(current) if current == record => {}
                _ => continue,
            }
            let path = self.path(&record.orchestration_id);
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            info!(
                orchestration_id = %record.orchestration_id,
                pid = record.pid,
                "removed orphaned runner record"
            );
            removed.push(record);
        }
        Ok(removed)
    }

    /// Write this process's record. Refuses when another live process holds
    /// the orchestration. The record is removed when the guard drops.
    pub fn claim(
        &self,
        orchestration_id: &str,
        pid: u32,
        now: DateTime<Utc>,
        is_alive: impl Fn(u32) -> bool,
    ) -> Result<RunnerGuard> {
        let _lock = self.lock(orchestration_id)?;
        if let Some(existing) = self.read(orchestration_id)?
            && existing.pid != pid
            && is_alive(existing.pid)
        {
            return Err(anyhow!(
                "orchestration {orchestration_id} is already driven by runner pid {}",
                existing.pid
            ));
        }
        let record = RunnerState {
            orchestration_id: orchestration_id.to_string(),
            pid,
            started_at: now,
        };
        let path = self.path(orchestration_id);
        write_json_atomic(&path, &record)?;
        debug!(path = %path.display(), pid, "runner record written");
        Ok(RunnerGuard { path, pid })
    }
}

fn read_record(path: &Path) -> Result<RunnerState> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Removes the runner record on drop, on every exit path.
#[derive(Debug)]
pub struct RunnerGuard {
    path: PathBuf,
    pid: u32,
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        // Only remove the record if it is still ours.
        match read_record(&self.path) {
            Ok(record) if record.pid == self.pid => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), err = %err, "failed to remove runner record");
                }
            }
            Ok(_) => debug!("runner record taken over, leaving it"),
            Err(_) => {}
        }
    }
}
