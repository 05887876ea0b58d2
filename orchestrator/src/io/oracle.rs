//! Diagnostic oracle backend.
//!
//! The oracle is an external agent asked a bounded question with a JSON
//! Schema for the answer. Only the recovery adapter holds one; see
//! `crate::recovery`.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::config::OracleConfig;
use super::process::run_command_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleTask {
    RecoverState,
    DiagnoseStaleWorkflow,
    DiagnoseFailedStep,
}

impl OracleTask {
    pub fn as_str(self) -> &'static str {
        match self {
            OracleTask::RecoverState => "recover_state",
            OracleTask::DiagnoseStaleWorkflow => "diagnose_stale_workflow",
            OracleTask::DiagnoseFailedStep => "diagnose_failed_step",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleRequest {
    pub task: OracleTask,
    /// Rendered prompt.
    pub context: String,
    pub model_tier: String,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    pub max_budget_usd: f64,
    pub response_schema: Value,
}

/// One reply: the answer document and the spend the backend reported.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleAnswer {
    pub value: Value,
    pub cost_usd: Option<f64>,
}

pub trait RecoveryOracle: Send + Sync {
    /// Ask one question. The answer is untrusted until validated.
    fn ask(&self, request: &OracleRequest) -> Result<OracleAnswer>;
}

/// Oracle that shells out to an agent CLI.
///
/// The prompt goes to stdin; model tier, tool allow-list, turn and budget
/// limits and the response schema go on the command line.
pub struct CommandOracle {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandOracle {
    pub fn new(config: &OracleConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: config.command.clone(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl RecoveryOracle for CommandOracle {
    #[instrument(skip_all, fields(task = request.task.as_str(), model = %request.model_tier))]
    fn ask(&self, request: &OracleRequest) -> Result<OracleAnswer> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("oracle command is empty"))?;
        let schema =
            serde_json::to_string(&request.response_schema).context("serialize response schema")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .args(["--output-format", "json"])
            .args(["--model", &request.model_tier])
            .args(["--max-turns", &request.max_turns.to_string()])
            .args(["--max-budget-usd", &format!("{:.2}", request.max_budget_usd)])
            .args(["--json-schema", &schema])
            .current_dir(&self.workdir);
        if !request.allowed_tools.is_empty() {
            cmd.args(["--allowedTools", &request.allowed_tools.join(",")]);
        }

        info!("consulting oracle");
        let output = run_command_with_timeout(
            cmd,
            Some(request.context.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )?;
        if output.timed_out {
            bail!("oracle timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "oracle exited with failure");
            bail!(
                "oracle exited with {:?}: {}{}",
                output.status.code(),
                stderr.trim(),
                output.stderr_truncated_notice("oracle")
            );
        }
        if output.stdout_truncated > 0 {
            bail!(
                "oracle output exceeded {} bytes{}",
                self.output_limit_bytes,
                output.stdout_truncated_notice("oracle")
            );
        }
        parse_oracle_output(&output.stdout)
    }
}

/// Extract the answer and `total_cost_usd` from the CLI's JSON envelope.
///
/// Preference order: `structured_output`, then a `result` string holding
/// JSON (optionally fenced), then the document itself.
pub fn parse_oracle_output(stdout: &[u8]) -> Result<OracleAnswer> {
    let envelope: Value = serde_json::from_slice(stdout).context("parse oracle output")?;
    let cost_usd = envelope.get("total_cost_usd").and_then(Value::as_f64);
    let value = answer_document(envelope)?;
    Ok(OracleAnswer { value, cost_usd })
}

fn answer_document(envelope: Value) -> Result<Value> {
    if envelope.get("is_error").and_then(Value::as_bool) == Some(true) {
        let detail = envelope
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or("no detail");
        bail!("oracle reported an error: {detail}");
    }
    if let Some(structured) = envelope.get("structured_output")
        && !structured.is_null()
    {
        debug!("using structured_output");
        return Ok(structured.clone());
    }
    if let Some(result) = envelope.get("result").and_then(Value::as_str) {
        debug!("parsing json from result text");
        return extract_json(result);
    }
    Ok(envelope)
}

fn extract_json(text: &str) -> Result<Value> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow!("oracle result contains no json object"))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| anyhow!("oracle result contains no json object"))?;
    if end < start {
        bail!("oracle result contains no json object");
    }
    serde_json::from_str(&text[start..=end]).context("parse json in oracle result")
}
