//! Gate evaluation pipeline for one iteration.
//!
//! Gates run in a fixed order (checklist, tests, validation, evidence,
//! approval). A gate that cannot be evaluated is recorded as `error` and the
//! iteration continues; it never aborts the loop.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::completion::candidate_ok;
use crate::core::types::{GateOutcomes, GateResult, GateStatus, PromiseOutcome};
use crate::error::SuperloopError;
use crate::io::atomic::write_atomic;
use crate::io::checklist::{ChecklistStatus, evaluate_checklist};
use crate::io::config::LoopConfig;
use crate::io::events::{EventKind, EventLedger};
use crate::io::evidence::{EvidenceRequest, evaluate_evidence};
use crate::io::paths::LoopPaths;
use crate::io::test_gate::{TestGateRequest, TestRunner, evaluate_tests};
use crate::io::validation::{ValidationRequest, evaluate_validation};

/// Inputs shared by every gate of one iteration.
pub struct GateContext<'a> {
    pub repo: &'a Path,
    pub loop_cfg: &'a LoopConfig,
    pub paths: &'a LoopPaths,
    pub ledger: &'a EventLedger,
    pub output_limit_bytes: usize,
    pub iteration: u32,
    pub promise: &'a PromiseOutcome,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GateReport {
    pub outcomes: GateOutcomes,
    /// `None` when the checklist scan itself failed.
    pub checklist: Option<ChecklistStatus>,
    pub synopsis: String,
}

impl GateReport {
    /// Outstanding checklist items, formatted for reports.
    pub fn unchecked(&self) -> Vec<String> {
        self.checklist
            .as_ref()
            .map(ChecklistStatus::describe_items)
            .unwrap_or_default()
    }
}

/// Evaluate every gate, emit one `gate_result` per gate, and write `gate-summary.txt`.
#[instrument(skip_all, fields(loop_id = %ctx.loop_cfg.id, iteration = ctx.iteration))]
pub fn evaluate_gates<R: TestRunner + ?Sized>(
    runner: &R,
    ctx: &GateContext<'_>,
) -> Result<GateReport> {
    let cfg = ctx.loop_cfg;
    let mut outcomes = GateOutcomes::default();

    let mut checklist = None;
    outcomes.checklist = guarded("checklist", || {
        let (result, status) = evaluate_checklist(ctx.repo, &cfg.checklist, ctx.paths, ctx.now)?;
        checklist = Some(status);
        Ok(result)
    });
    emit_gate(ctx, "checklist", &outcomes.checklist)?;

    // A disabled checklist never triggers `on_promise` tests.
    let checklist_ok = outcomes.checklist.status == GateStatus::Ok;
    outcomes.tests = guarded("tests", || {
        evaluate_tests(
            runner,
            &TestGateRequest {
                config: &cfg.tests,
                repo: ctx.repo.to_path_buf(),
                output_limit_bytes: ctx.output_limit_bytes,
                promise_matched: ctx.promise.matched,
                checklist_ok,
                paths: ctx.paths,
                iteration: ctx.iteration,
                now: ctx.now,
            },
        )
    });
    emit_gate(ctx, "tests", &outcomes.tests)?;

    outcomes.validation = guarded("validation", || {
        evaluate_validation(&ValidationRequest {
            repo: ctx.repo,
            config: &cfg.validation,
            paths: ctx.paths,
            output_limit_bytes: ctx.output_limit_bytes,
            iteration: ctx.iteration,
            now: ctx.now,
        })
    });
    emit_gate(ctx, "validation", &outcomes.validation)?;

    let status_files = [ctx.paths.test_status.clone(), ctx.paths.checklist_status.clone()];
    outcomes.evidence = guarded("evidence", || {
        evaluate_evidence(&EvidenceRequest {
            repo: ctx.repo,
            config: &cfg.evidence,
            status_files: &status_files,
            manifest_path: &ctx.paths.evidence,
            iteration: ctx.iteration,
            now: ctx.now,
        })
    });
    emit_gate(ctx, "evidence", &outcomes.evidence)?;

    outcomes.approval = approval_gate(ctx, &outcomes);
    emit_gate(ctx, "approval", &outcomes.approval)?;

    let synopsis = synopsis(ctx.iteration, ctx.promise, &outcomes);
    write_atomic(&ctx.paths.gate_summary, format!("{synopsis}\n").as_bytes())?;
    info!(summary = %synopsis, "gates evaluated");
    ctx.ledger.emit(EventKind::GatesEvaluated, ctx.iteration, |e| {
        e.message(synopsis.clone())
            .data(serde_json::to_value(&outcomes).unwrap_or_default())
    })?;

    Ok(GateReport {
        outcomes,
        checklist,
        synopsis,
    })
}

/// Pending when the candidate is ready and a human must decide; the
/// controller then persists the request.
fn approval_gate(ctx: &GateContext<'_>, outcomes: &GateOutcomes) -> GateResult {
    if !ctx.loop_cfg.approval.required {
        return GateResult::disabled();
    }
    if candidate_ok(ctx.promise, outcomes, &ctx.loop_cfg.gate_policy()) {
        return GateResult {
            status: GateStatus::Pending,
            ok: false,
            detail: Some("awaiting human decision".to_string()),
        };
    }
    GateResult::skipped("candidate not ready")
}

fn guarded(gate: &str, eval: impl FnOnce() -> Result<GateResult>) -> GateResult {
    match eval() {
        Ok(result) => result,
        Err(err) => {
            let err = SuperloopError::GateEvaluation {
                gate: gate.to_string(),
                message: format!("{err:#}"),
            };
            warn!(gate, err = %err, "gate evaluation failed");
            GateResult::error(err.to_string())
        }
    }
}

fn emit_gate(ctx: &GateContext<'_>, gate: &str, result: &GateResult) -> Result<()> {
    ctx.ledger.emit(EventKind::GateResult, ctx.iteration, |e| {
        let e = e
            .status(result.status.as_str())
            .data(json!({ "gate": gate, "ok": result.ok }));
        match &result.detail {
            Some(detail) => e.message(detail.clone()),
            None => e,
        }
    })
}

/// One line, e.g. `iteration 3: promise=matched checklist=ok tests=failed(...) ...`.
pub fn synopsis(iteration: u32, promise: &PromiseOutcome, outcomes: &GateOutcomes) -> String {
    let gate = |name: &str, result: &GateResult| match &result.detail {
        Some(detail) if !result.ok => format!("{name}={}({detail})", result.status.as_str()),
        _ => format!("{name}={}", result.status.as_str()),
    };
    let promise = if promise.matched {
        "matched"
    } else {
        "missing"
    };
    format!(
        "iteration {iteration}: promise={promise} {} {} {} {} {}",
        gate("checklist", &outcomes.checklist),
        gate("tests", &outcomes.tests),
        gate("validation", &outcomes.validation),
        gate("evidence", &outcomes.evidence),
        gate("approval", &outcomes.approval),
    )
}
