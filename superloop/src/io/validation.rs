//! Validation gate: aggregate pass/fail of external sub-checks.
//!
//! Each check is a shell command that writes a JSON result document with a
//! top-level boolean `ok`. Blocking checks decide the gate; advisory checks
//! are recorded only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::GateResult;
use crate::io::atomic::{read_json, remove_if_exists, write_json_atomic};
use crate::io::config::{ValidationCheck, ValidationConfig};
use crate::io::paths::LoopPaths;
use crate::io::process::{CommandSpec, run_with_timeout};
use crate::io::schema::{VALIDATION_RESULT_SCHEMA, validate_document};

/// Environment variable carrying the result path to each check.
pub const RESULT_FILE_ENV: &str = "SUPERLOOP_RESULT_FILE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub blocking: bool,
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub result_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `validation-status.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStatus {
    pub ok: bool,
    pub iteration: u32,
    pub checks: Vec<CheckOutcome>,
    pub checked_at: DateTime<Utc>,
}

pub struct ValidationRequest<'a> {
    pub repo: &'a Path,
    pub config: &'a ValidationConfig,
    pub paths: &'a LoopPaths,
    pub output_limit_bytes: usize,
    pub iteration: u32,
    pub now: DateTime<Utc>,
}

#[instrument(skip_all, fields(checks = request.config.checks.len()))]
pub fn evaluate_validation(request: &ValidationRequest<'_>) -> Result<GateResult> {
    if !request.config.enabled {
        return Ok(GateResult::disabled());
    }

    let mut checks = Vec::with_capacity(request.config.checks.len());
    for check in &request.config.checks {
        checks.push(run_check(request, check)?);
    }

    let ok = checks.iter().filter(|c| c.blocking).all(|c| c.ok);
    let status = ValidationStatus {
        ok,
        iteration: request.iteration,
        checks,
        checked_at: request.now,
    };
    write_json_atomic(&request.paths.validation_status, &status)?;

    if ok {
        let advisory_failures = status.checks.iter().filter(|c| !c.ok).count();
        let result = GateResult::passed();
        if advisory_failures > 0 {
            return Ok(result.with_detail(format!("{advisory_failures} advisory check(s) failed")));
        }
        return Ok(result);
    }
    let failed: Vec<&str> = status
        .checks
        .iter()
        .filter(|c| c.blocking && !c.ok)
        .map(|c| c.name.as_str())
        .collect();
    Ok(GateResult::failed(format!("blocking: {}", failed.join(", "))))
}

fn result_path(request: &ValidationRequest<'_>, check: &ValidationCheck) -> PathBuf {
    match &check.result_file {
        Some(rel) => request.repo.join(rel),
        None => request.paths.validation_dir.join(format!("{}.json", check.name)),
    }
}

fn run_check(request: &ValidationRequest<'_>, check: &ValidationCheck) -> Result<CheckOutcome> {
    let path = result_path(request, check);
    // A result left over from a previous iteration must not count.
    remove_if_exists(&path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create validation dir {}", parent.display()))?;
    }

    info!(check = %check.name, "running validation check");
    let spec = CommandSpec::new(&check.command, request.repo, Duration::from_secs(check.timeout_secs))
        .with_env(RESULT_FILE_ENV, path.display().to_string());
    let output = run_with_timeout(&spec, request.output_limit_bytes)?;

    let mut outcome = CheckOutcome {
        name: check.name.clone(),
        blocking: check.blocking,
        ok: false,
        exit_code: output.exit_code,
        result_file: path
            .strip_prefix(request.repo)
            .unwrap_or(&path)
            .display()
            .to_string(),
        summary: None,
        error: None,
    };

    if output.timed_out {
        outcome.error = Some(format!("timed out after {}s", check.timeout_secs));
        return Ok(outcome);
    }
    match read_result(&path) {
        Ok((ok, summary)) => {
            outcome.ok = ok;
            outcome.summary = summary;
        }
        Err(err) => {
            warn!(check = %check.name, err = %format!("{err:#}"), "validation result unusable");
            outcome.error = Some(format!("{err:#}"));
        }
    }
    debug!(check = %check.name, ok = outcome.ok, "validation check finished");
    Ok(outcome)
}

fn read_result(path: &Path) -> Result<(bool, Option<String>)> {
    if !path.exists() {
        anyhow::bail!("no result document at {}", path.display());
    }
    let doc: Value = read_json(path)?;
    validate_document(VALIDATION_RESULT_SCHEMA, &doc, "validation result")?;
    let ok = doc.get("ok").and_then(Value::as_bool).unwrap_or(false);
    let summary = doc
        .get("summary")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok((ok, summary))
}
