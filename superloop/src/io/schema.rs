//! JSON Schema validation for documents written by external processes.

use anyhow::{Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

pub const VALIDATION_RESULT_SCHEMA: &str =
    include_str!("../../schemas/validation_result.schema.json");
pub const RECOVERY_PROPOSAL_SCHEMA: &str =
    include_str!("../../schemas/recovery_proposal.schema.json");

/// Validate `doc` against an embedded schema, reporting every violation.
pub fn validate_document(schema: &str, doc: &Value, label: &str) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(schema).map_err(|err| anyhow!("parse {label} schema: {err}"))?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid {label} schema: {err}"))?;
    if !compiled.is_valid(doc) {
        let messages = compiled
            .iter_errors(doc)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "{label} schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
