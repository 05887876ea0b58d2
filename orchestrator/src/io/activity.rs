//! Append-only activity signals (`.orchestrator/activity/<id>.jsonl`).
//!
//! Only the most recent signals matter, so reads look at a bounded tail of the
//! file and an append that pushes it past `max_bytes` compacts it to that tail.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::fs_util::write_atomic;
use crate::core::activity::ActivitySignal;

/// Bytes from the end of the log that reads consider.
pub const READ_WINDOW_BYTES: u64 = 64 * 1024;
/// Size past which an append compacts the log.
pub const MAX_LOG_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone)]
pub struct ActivityLog {
    dir: PathBuf,
    window_bytes: u64,
    max_bytes: u64,
}

impl ActivityLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_limits(dir, READ_WINDOW_BYTES, MAX_LOG_BYTES)
    }

    pub fn with_limits(dir: impl Into<PathBuf>, window_bytes: u64, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            window_bytes,
            max_bytes: max_bytes.max(window_bytes),
        }
    }

    fn path(&self, orchestration_id: &str) -> PathBuf {
        self.dir.join(format!("{orchestration_id}.jsonl"))
    }

    pub fn append(&self, orchestration_id: &str, signal: &ActivitySignal) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create directory {}", self.dir.display()))?;
        let path = self.path(orchestration_id);
        let mut line = serde_json::to_string(signal).context("serialize activity signal")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        debug!(source = ?signal.source, "activity signal recorded");

        let len = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        drop(file);
        if len > self.max_bytes {
            let tail = self.read_tail(&path)?;
            write_atomic(&path, &tail)?;
            info!(path = %path.display(), from_bytes = len, to_bytes = tail.len(), "activity log compacted");
        }
        Ok(())
    }

    /// The most recent readable signals in append order. Malformed lines are
    /// skipped.
    pub fn read(&self, orchestration_id: &str) -> Result<Vec<ActivitySignal>> {
        let path = self.path(orchestration_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = self.read_tail(&path)?;
        let mut signals = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(signal) => signals.push(signal),
                Err(err) => warn!(line = number + 1, err = %err, "skipping malformed activity line"),
            }
        }
        Ok(signals)
    }

    /// Whole lines within the last `window_bytes` of the file.
    fn read_tail(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        let start = len.saturating_sub(self.window_bytes);
        file.seek(SeekFrom::Start(start))
            .with_context(|| format!("seek {}", path.display()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        let mut contents = String::from_utf8_lossy(&buf).into_owned();
        if start > 0 {
            // The window may open mid-line.
            let first_newline = contents.find('\n').map_or(contents.len(), |i| i + 1);
            contents.drain(..first_newline);
        }
        Ok(contents)
    }
}
