//! Recovery proposal, budget state and escalation records under `recovery/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::recovery_policy::RecoveryState;
use crate::io::atomic::{read_json, read_json_opt, write_json_atomic};
use crate::io::schema::{RECOVERY_PROPOSAL_SCHEMA, validate_document};

/// Out-of-band remediation proposed by a role or an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryProposal {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub recovery: RecoveryAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl RecoveryAction {
    /// Missing confidence counts as full confidence.
    pub fn confidence(&self) -> f64 {
        self.confidence.unwrap_or(1.0)
    }
}

/// Load and schema-check `proposal.json`; `None` when absent.
pub fn load_proposal(path: &Path) -> Result<Option<RecoveryProposal>> {
    if !path.exists() {
        return Ok(None);
    }
    let doc: Value = read_json(path)?;
    validate_document(RECOVERY_PROPOSAL_SCHEMA, &doc, "recovery proposal")?;
    let proposal = serde_json::from_value(doc)
        .with_context(|| format!("deserialize recovery proposal {}", path.display()))?;
    Ok(Some(proposal))
}

/// Load the budget state, starting fresh when the run id changed.
pub fn load_recovery_state(path: &Path, run_id: &str) -> Result<RecoveryState> {
    let state: Option<RecoveryState> = read_json_opt(path)?;
    match state {
        Some(state) if state.run_id.as_deref() == Some(run_id) => Ok(state),
        _ => {
            debug!(run_id, "starting fresh recovery budget");
            Ok(RecoveryState {
                run_id: Some(run_id.to_string()),
                ..RecoveryState::default()
            })
        }
    }
}

pub fn save_recovery_state(path: &Path, state: &RecoveryState) -> Result<()> {
    write_json_atomic(path, state)
}

/// Resolve `working_dir` against the repository, refusing anything outside it.
pub fn resolve_working_dir(repo: &Path, working_dir: Option<&str>) -> Result<PathBuf> {
    let repo = fs::canonicalize(repo).with_context(|| format!("resolve {}", repo.display()))?;
    let Some(dir) = working_dir.filter(|d| !d.trim().is_empty()) else {
        return Ok(repo);
    };
    let candidate = repo.join(dir);
    let resolved = fs::canonicalize(&candidate)
        .with_context(|| format!("resolve recovery working_dir {}", candidate.display()))?;
    if !resolved.starts_with(&repo) {
        bail!(
            "recovery working_dir {} is outside the repository",
            resolved.display()
        );
    }
    Ok(resolved)
}

/// `escalation.json`: a proposal waiting on a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub at: DateTime<Utc>,
    pub loop_id: String,
    pub run_id: String,
    pub iteration: u32,
    /// `blocked` or `escalated`.
    pub decision: String,
    pub reason: String,
    pub proposal: RecoveryProposal,
}

pub fn write_escalation(path: &Path, record: &EscalationRecord) -> Result<()> {
    write_json_atomic(path, record)
}
