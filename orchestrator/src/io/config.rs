//! Loop configuration stored under `.orchestrator/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::decision::DecisionLimits;

/// Control loop configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Upper bound on one wait when nothing wakes the loop earlier.
    pub poll_interval_secs: u64,

    /// Stop after this many iterations. `0` runs until a terminal status.
    pub max_iterations: u32,

    /// A spawn intent younger than this blocks other spawners.
    pub spawn_intent_ttl_secs: u64,

    pub workflow_stale_threshold_secs: u64,
    pub batch_stale_threshold_secs: u64,
    pub max_run_duration_secs: u64,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_lookup_failures: u32,

    /// Task list parsed into implement batches, relative to the project root.
    pub tasks_file: PathBuf,

    /// Where heuristic recovery looks for spec, plan and task artifacts.
    pub artifacts_dir: PathBuf,

    pub worker: WorkerConfig,
    pub oracle: OracleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker command; the skill prompt is appended as the last argument.
    pub command: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    /// Diagnostic CLI; the rendered prompt is written to its stdin.
    pub command: Vec<String>,
    pub model_tier: String,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    pub max_budget_usd: f64,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Tail of the worker log included when diagnosing a stale workflow.
    pub transcript_excerpt_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            model_tier: "sonnet".to_string(),
            allowed_tools: vec!["Read".to_string(), "Grep".to_string(), "Glob".to_string()],
            max_turns: 8,
            max_budget_usd: 1.0,
            timeout_secs: 5 * 60,
            output_limit_bytes: 200_000,
            transcript_excerpt_bytes: 16_000,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_iterations: 0,
            spawn_intent_ttl_secs: 30,
            workflow_stale_threshold_secs: 10 * 60,
            batch_stale_threshold_secs: 15 * 60,
            max_run_duration_secs: 4 * 60 * 60,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            max_lookup_failures: 8,
            tasks_file: PathBuf::from("tasks.md"),
            artifacts_dir: PathBuf::from("."),
            worker: WorkerConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.workflow_stale_threshold_secs == 0 || self.batch_stale_threshold_secs == 0 {
            return Err(anyhow!("stale thresholds must be > 0"));
        }
        if self.max_run_duration_secs == 0 {
            return Err(anyhow!("max_run_duration_secs must be > 0"));
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            return Err(anyhow!(
                "backoff_base_ms must be > 0 and <= backoff_max_ms"
            ));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!("oracle.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn limits(&self) -> DecisionLimits {
        DecisionLimits {
            workflow_stale_threshold: Duration::from_secs(self.workflow_stale_threshold_secs),
            batch_stale_threshold: Duration::from_secs(self.batch_stale_threshold_secs),
            max_run_duration: Duration::from_secs(self.max_run_duration_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            max_lookup_failures: self.max_lookup_failures,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn spawn_intent_ttl(&self) -> Duration {
        Duration::from_secs(self.spawn_intent_ttl_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::fs_util::write_atomic(path, &buf)
}
