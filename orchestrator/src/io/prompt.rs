//! Prompt rendering for the diagnostic oracle.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

const RECOVER_STATE_TEMPLATE: &str = include_str!("prompts/recover_state.md");
const DIAGNOSE_STALE_TEMPLATE: &str = include_str!("prompts/diagnose_stale.md");
const DIAGNOSE_FAILED_TEMPLATE: &str = include_str!("prompts/diagnose_failed.md");

/// Batch details shown to the oracle. `position` is 1-based.
#[derive(Debug, Clone, Serialize)]
pub struct BatchContext {
    pub position: u32,
    pub total: u32,
    pub section: String,
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RecoverStatePrompt<'a> {
    pub orchestration_id: &'a str,
    pub problem: &'a str,
    pub raw_state: Option<&'a str>,
    pub artifacts: &'a [String],
}

#[derive(Debug, Clone)]
pub struct DiagnoseStalePrompt<'a> {
    pub orchestration_id: &'a str,
    pub step: &'a str,
    pub batch: Option<BatchContext>,
    pub workflow_id: &'a str,
    pub idle_minutes: u64,
    pub transcript: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct DiagnoseFailedPrompt<'a> {
    pub orchestration_id: &'a str,
    pub step: &'a str,
    pub batch: Option<BatchContext>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<&'a str>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("recover_state", RECOVER_STATE_TEMPLATE)
            .context("load recover_state template")?;
        env.add_template("diagnose_stale", DIAGNOSE_STALE_TEMPLATE)
            .context("load diagnose_stale template")?;
        env.add_template("diagnose_failed", DIAGNOSE_FAILED_TEMPLATE)
            .context("load diagnose_failed template")?;
        Ok(Self { env })
    }

    pub fn render_recover_state(&self, input: &RecoverStatePrompt<'_>) -> Result<String> {
        let template = self.env.get_template("recover_state")?;
        let rendered = template.render(context! {
            orchestration_id => input.orchestration_id,
            problem => input.problem,
            raw_state => input.raw_state.map(str::trim).filter(|s| !s.is_empty()),
            artifacts => input.artifacts,
        })?;
        Ok(rendered)
    }

    pub fn render_diagnose_stale(&self, input: &DiagnoseStalePrompt<'_>) -> Result<String> {
        let template = self.env.get_template("diagnose_stale")?;
        let rendered = template.render(context! {
            orchestration_id => input.orchestration_id,
            step => input.step,
            batch => input.batch,
            workflow_id => input.workflow_id,
            idle_minutes => input.idle_minutes,
            transcript => input.transcript.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    pub fn render_diagnose_failed(&self, input: &DiagnoseFailedPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("diagnose_failed")?;
        let rendered = template.render(context! {
            orchestration_id => input.orchestration_id,
            step => input.step,
            batch => input.batch,
            attempts => input.attempts,
            max_attempts => input.max_attempts,
            last_error => input.last_error,
        })?;
        Ok(rendered)
    }
}
