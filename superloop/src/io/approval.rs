//! Approval checkpoint (`approval.json`).

use std::path::Path;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::types::{GateOutcomes, GateResult, GateStatus, PromiseOutcome};
use crate::io::atomic::{read_json_opt, remove_if_exists, write_json_atomic};
use crate::io::evidence::ArtifactMeta;
use crate::io::run_summary::StuckSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    /// Approval gate result for this status.
    pub fn gate_result(self) -> GateResult {
        match self {
            ApprovalStatus::Pending => GateResult {
                status: GateStatus::Pending,
                ok: false,
                detail: Some("awaiting human decision".to_string()),
            },
            ApprovalStatus::Approved => GateResult {
                status: GateStatus::Approved,
                ok: true,
                detail: None,
            },
            ApprovalStatus::Rejected => GateResult {
                status: GateStatus::Rejected,
                ok: false,
                detail: None,
            },
        }
    }
}

/// The iteration outcome waiting on a decision; replayed into the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalCandidate {
    pub promise: PromiseOutcome,
    pub gates: GateOutcomes,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck: Option<StuckSnapshot>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub status: ApprovalStatus,
    pub loop_id: String,
    pub run_id: String,
    pub iteration: u32,
    pub requested_at: DateTime<Utc>,
    pub candidate: ApprovalCandidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
}

pub fn load_approval(path: &Path) -> Result<Option<ApprovalRequest>> {
    read_json_opt(path)
}

pub fn write_approval(path: &Path, request: &ApprovalRequest) -> Result<()> {
    write_json_atomic(path, request)
}

/// Record a human decision on a pending request.
pub fn record_decision(
    path: &Path,
    status: ApprovalStatus,
    by: &str,
    note: Option<String>,
    now: DateTime<Utc>,
) -> Result<ApprovalRequest> {
    if status == ApprovalStatus::Pending {
        bail!("a decision must approve or reject");
    }
    let Some(mut request) = load_approval(path)? else {
        bail!("no approval request at {}", path.display());
    };
    if request.status != ApprovalStatus::Pending {
        bail!(
            "approval for iteration {} was already {}",
            request.iteration,
            request.status.as_str()
        );
    }
    request.status = status;
    request.decision = Some(ApprovalDecision {
        by: by.to_string(),
        note,
        at: now,
    });
    write_approval(path, &request)?;
    info!(loop_id = %request.loop_id, iteration = request.iteration, status = status.as_str(), "approval decision recorded");
    Ok(request)
}

/// Delete the request once its decision is in the run summary.
pub fn consume(path: &Path) -> Result<()> {
    remove_if_exists(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    fn pending() -> ApprovalRequest {
        ApprovalRequest {
            status: ApprovalStatus::Pending,
            loop_id: "main".to_string(),
            run_id: "run-1".to_string(),
            iteration: 2,
            requested_at: now(),
            candidate: ApprovalCandidate {
                promise: PromiseOutcome {
                    expected: "DONE".to_string(),
                    text: Some("DONE".to_string()),
                    matched: true,
                },
                gates: GateOutcomes::default(),
                started_at: now(),
                ended_at: now(),
                stuck: None,
                artifacts: Vec::new(),
            },
            decision: None,
        }
    }

    #[test]
    fn decision_is_recorded_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("approval.json");
        write_approval(&path, &pending()).expect("write");

        let decided = record_decision(
            &path,
            ApprovalStatus::Approved,
            "alex",
            Some("looks good".to_string()),
            now(),
        )
        .expect("approve");
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(load_approval(&path).expect("load"), Some(decided));

        let err = record_decision(&path, ApprovalStatus::Rejected, "sam", None, now())
            .expect_err("already decided");
        assert!(err.to_string().contains("already approved"));

        consume(&path).expect("consume");
        assert!(load_approval(&path).expect("load").is_none());
    }

    #[test]
    fn deciding_without_request_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = record_decision(
            &temp.path().join("approval.json"),
            ApprovalStatus::Approved,
            "alex",
            None,
            now(),
        )
        .expect_err("missing");
        assert!(err.to_string().contains("no approval request"));
    }

    #[test]
    fn gate_results_follow_status() {
        assert!(!ApprovalStatus::Pending.gate_result().ok);
        assert_eq!(ApprovalStatus::Approved.gate_result().status, GateStatus::Approved);
        assert!(!ApprovalStatus::Rejected.gate_result().ok);
    }
}
