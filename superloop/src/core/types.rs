//! Shared deterministic types for superloop core logic.
//!
//! These types define stable contracts between the controller, the gate
//! evaluator and the persisted ledger. They must not depend on I/O and must
//! serialize identically across runs.

use serde::{Deserialize, Serialize};

use crate::core::rate_limit::RateLimitInfo;
use crate::exit_codes;

/// Classification of a single gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// Gate ran and passed.
    Ok,
    /// Gate ran and failed.
    Failed,
    /// Gate is configured but was not run this iteration.
    Skipped,
    /// Gate is not configured for this loop.
    Disabled,
    /// Gate could not be evaluated (I/O failure, spawn failure, ...).
    Error,
    /// Approval gate: a decision is outstanding.
    Pending,
    /// Approval gate: a human approved the candidate.
    Approved,
    /// Approval gate: a human rejected the candidate.
    Rejected,
}

impl GateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GateStatus::Ok => "ok",
            GateStatus::Failed => "failed",
            GateStatus::Skipped => "skipped",
            GateStatus::Disabled => "disabled",
            GateStatus::Error => "error",
            GateStatus::Pending => "pending",
            GateStatus::Approved => "approved",
            GateStatus::Rejected => "rejected",
        }
    }
}

/// Outcome of one gate for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub status: GateStatus,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl GateResult {
    pub fn passed() -> Self {
        Self {
            status: GateStatus::Ok,
            ok: true,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Failed,
            ok: false,
            detail: Some(detail.into()),
        }
    }

    /// Configured but not run; never counts as passing.
    pub fn skipped(detail: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Skipped,
            ok: false,
            detail: Some(detail.into()),
        }
    }

    /// Not configured; vacuously passing.
    pub fn disabled() -> Self {
        Self {
            status: GateStatus::Disabled,
            ok: true,
            detail: None,
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Error,
            ok: false,
            detail: Some(detail.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Per-iteration gate outcomes, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcomes {
    pub checklist: GateResult,
    pub tests: GateResult,
    pub validation: GateResult,
    pub evidence: GateResult,
    pub approval: GateResult,
}

impl Default for GateOutcomes {
    fn default() -> Self {
        Self {
            checklist: GateResult::disabled(),
            tests: GateResult::disabled(),
            validation: GateResult::disabled(),
            evidence: GateResult::disabled(),
            approval: GateResult::disabled(),
        }
    }
}

/// Completion-promise comparison for the final role of an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseOutcome {
    pub expected: String,
    pub text: Option<String>,
    pub matched: bool,
}

/// Which completion requirements a loop enforces beyond promise, tests and checklist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatePolicy {
    pub validation_required: bool,
    pub evidence_required: bool,
    pub approval_required: bool,
}

/// Which deadline terminated a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// `max_timeout` measured from process start.
    HardCeiling,
    /// `inactivity_timeout` measured from the last output line.
    Inactivity,
}

impl TimeoutKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutKind::HardCeiling => "hard_ceiling",
            TimeoutKind::Inactivity => "inactivity",
        }
    }
}

/// Classified exit of one role (or one session) process.
///
/// Timeouts and rate limits are reserved sentinels, distinct from any real
/// exit code, so the controller treats them as resumable pauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleExit {
    Success,
    TimedOut(TimeoutKind),
    RateLimited(RateLimitInfo),
    Failed(i32),
}

impl RoleExit {
    /// Numeric code used in events and logs.
    pub fn code(&self) -> i32 {
        match self {
            RoleExit::Success => exit_codes::OK,
            RoleExit::TimedOut(_) => exit_codes::TIMEOUT_SENTINEL,
            RoleExit::RateLimited(_) => exit_codes::RATE_LIMIT_SENTINEL,
            RoleExit::Failed(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RoleExit::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RoleExit::Success => "ok",
            RoleExit::TimedOut(_) => "timeout",
            RoleExit::RateLimited(_) => "rate_limited",
            RoleExit::Failed(_) => "failed",
        }
    }
}
