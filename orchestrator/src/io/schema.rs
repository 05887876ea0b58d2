//! Embedded JSON Schemas and validation against them.

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

pub const ORCHESTRATION_STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/orchestration_state.schema.json"
));
pub const RECOVER_STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/recover_state.schema.json"
));
pub const DIAGNOSE_STALE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/diagnose_stale.schema.json"
));
pub const DIAGNOSE_FAILED_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/diagnose_failed.schema.json"
));

pub fn parse_schema(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("parse json schema")
}

/// Validate a JSON instance against a JSON Schema (Draft 2020-12).
pub fn validate_instance(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed: {}", messages.join("; "));
    }
    Ok(())
}
