//! Recovery engine: apply an out-of-band remediation proposal at a safe point.
//!
//! The controller calls [`attempt_recovery`] after every iteration that did
//! not complete and before aborting on a role failure. Every decision is
//! written to the event ledger.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::recovery_policy::{Decision, RecoveryPolicy, decide};
use crate::io::atomic::remove_if_exists;
use crate::io::events::{EventKind, EventLedger};
use crate::io::paths::LoopPaths;
use crate::io::process::{CommandSpec, run_with_timeout};
use crate::io::recovery::{
    EscalationRecord, RecoveryProposal, load_proposal, load_recovery_state, resolve_working_dir,
    save_recovery_state, write_escalation,
};

pub struct RecoveryContext<'a> {
    pub repo: &'a Path,
    pub policy: &'a RecoveryPolicy,
    pub paths: &'a LoopPaths,
    pub ledger: &'a EventLedger,
    pub loop_id: &'a str,
    pub iteration: u32,
    pub output_limit_bytes: usize,
    pub now: DateTime<Utc>,
}

/// What happened to the pending proposal, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    NoProposal,
    /// Ran and exited 0; the proposal was deleted.
    Executed,
    /// Ran (or could not start) and failed; the proposal is kept.
    Failed(String),
    Denied(String),
    Blocked(String),
    Escalated(String),
}

#[instrument(skip_all, fields(loop_id = ctx.loop_id, iteration = ctx.iteration))]
pub fn attempt_recovery(ctx: &RecoveryContext<'_>) -> Result<RecoveryOutcome> {
    let proposal = match load_proposal(&ctx.paths.recovery_proposal) {
        Ok(Some(proposal)) => proposal,
        Ok(None) => return Ok(RecoveryOutcome::NoProposal),
        Err(err) => {
            let reason = format!("invalid proposal: {err:#}");
            warn!(reason = %reason, "recovery proposal rejected");
            ctx.ledger.emit(EventKind::RecoveryDenied, ctx.iteration, |e| {
                e.status("denied").message(reason.clone())
            })?;
            return Ok(RecoveryOutcome::Denied(reason));
        }
    };

    let action = &proposal.recovery;
    ctx.ledger.emit(EventKind::RecoveryProposed, ctx.iteration, |e| {
        e.message(action.command.clone()).data(json!({
            "category": proposal.category,
            "confidence": action.confidence(),
            "working_dir": action.working_dir,
        }))
    })?;

    let run_id = ctx.ledger.run_id();
    let mut state = load_recovery_state(&ctx.paths.recovery_state, run_id)?;
    let decision = decide(ctx.policy, &state, &action.command, action.confidence(), ctx.now);
    info!(command = %action.command, decision = ?decision, "recovery decision");

    match decision {
        Decision::Approved(reason) => {
            ctx.ledger.emit(EventKind::RecoveryApproved, ctx.iteration, |e| {
                e.status("approved").message(reason)
            })?;
        }
        Decision::Denied(reason) => {
            ctx.ledger.emit(EventKind::RecoveryDenied, ctx.iteration, |e| {
                e.status("denied").message(reason.clone())
            })?;
            return Ok(RecoveryOutcome::Denied(reason));
        }
        Decision::Blocked(reason) => {
            escalate(ctx, "blocked", &reason, &proposal)?;
            ctx.ledger.emit(EventKind::RecoveryBlocked, ctx.iteration, |e| {
                e.status("blocked").message(reason.clone())
            })?;
            return Ok(RecoveryOutcome::Blocked(reason));
        }
        Decision::Escalated(reason) => {
            escalate(ctx, "escalated", &reason, &proposal)?;
            ctx.ledger.emit(EventKind::RecoveryEscalated, ctx.iteration, |e| {
                e.status("escalated").message(reason.clone())
            })?;
            return Ok(RecoveryOutcome::Escalated(reason));
        }
    }

    let workdir = match resolve_working_dir(ctx.repo, action.working_dir.as_deref()) {
        Ok(dir) => dir,
        Err(err) => {
            let reason = format!("{err:#}");
            ctx.ledger.emit(EventKind::RecoveryFailed, ctx.iteration, |e| {
                e.status("failed").message(reason.clone())
            })?;
            return Ok(RecoveryOutcome::Failed(reason));
        }
    };
    let timeout = Duration::from_secs(action.timeout_seconds.unwrap_or(ctx.policy.timeout_secs));
    let output = run_with_timeout(&CommandSpec::new(&action.command, workdir, timeout), ctx.output_limit_bytes)?;

    state.record_execution(ctx.now);
    save_recovery_state(&ctx.paths.recovery_state, &state)?;

    let data = json!({
        "command": action.command,
        "exit_code": output.exit_code,
        "timed_out": output.timed_out,
        "recoveries_this_run": state.recoveries_this_run,
    });
    if output.success() {
        remove_if_exists(&ctx.paths.recovery_proposal)?;
        info!(command = %action.command, "recovery executed");
        ctx.ledger.emit(EventKind::RecoveryExecuted, ctx.iteration, |e| {
            e.status("ok").data(data)
        })?;
        return Ok(RecoveryOutcome::Executed);
    }

    let reason = if output.timed_out {
        format!("timed out after {}s", timeout.as_secs())
    } else {
        format!("exit code {}", output.exit_code.unwrap_or(-1))
    };
    warn!(command = %action.command, reason = %reason, "recovery command failed");
    ctx.ledger.emit(EventKind::RecoveryFailed, ctx.iteration, |e| {
        e.status("failed")
            .message(format!("{reason}\n{}", output.combined("recovery")))
            .data(data)
    })?;
    Ok(RecoveryOutcome::Failed(reason))
}

fn escalate(
    ctx: &RecoveryContext<'_>,
    decision: &str,
    reason: &str,
    proposal: &RecoveryProposal,
) -> Result<()> {
    write_escalation(
        &ctx.paths.recovery_escalation,
        &EscalationRecord {
            at: ctx.now,
            loop_id: ctx.loop_id.to_string(),
            run_id: ctx.ledger.run_id().to_string(),
            iteration: ctx.iteration,
            decision: decision.to_string(),
            reason: reason.to_string(),
            proposal: proposal.clone(),
        },
    )
}
