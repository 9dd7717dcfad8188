//! `superloop status`: run state plus a per-loop digest of the ledger.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;

use crate::io::approval::{ApprovalStatus, load_approval};
use crate::io::config::SuperloopConfig;
use crate::io::events::{LedgerView, read_events, replay};
use crate::io::paths::SuperloopPaths;
use crate::io::run_state::{
    RateLimitCheckpoint, RunState, load_rate_limit_checkpoint, load_run_state,
};
use crate::io::run_summary::{IterationRecord, load_run_summary};

#[derive(Debug, Clone)]
pub struct LoopStatus {
    pub loop_id: String,
    pub last_entry: Option<IterationRecord>,
    pub ledger: LedgerView,
    pub pending_approval: Option<u32>,
    pub rate_limit: Option<RateLimitCheckpoint>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: RunState,
    pub loops: Vec<LoopStatus>,
}

pub fn collect_status(repo: &Path, config: &SuperloopConfig) -> Result<StatusReport> {
    let paths = SuperloopPaths::new(repo);
    let state = load_run_state(&paths.state)?;
    let mut loops = Vec::with_capacity(config.loops.len());
    for lp in &config.loops {
        let lp_paths = paths.loop_paths(&lp.id);
        let last_entry = load_run_summary(&lp_paths.run_summary)?
            .and_then(|summary| summary.entries.into_iter().last());
        let pending_approval = load_approval(&lp_paths.approval)?
            .filter(|request| request.status == ApprovalStatus::Pending)
            .map(|request| request.iteration);
        loops.push(LoopStatus {
            loop_id: lp.id.clone(),
            last_entry,
            ledger: replay(&read_events(&lp_paths.events)?),
            pending_approval,
            rate_limit: load_rate_limit_checkpoint(&lp_paths.rate_limit)?,
        });
    }
    Ok(StatusReport { state, loops })
}

pub fn render_status(report: &StatusReport) -> String {
    let state = &report.state;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "state: {} loop_index={} iteration={} loop={} run={}",
        if state.active { "active" } else { "idle" },
        state.loop_index,
        state.iteration,
        state.current_loop_id.as_deref().unwrap_or("-"),
        state.run_id.as_deref().unwrap_or("-"),
    );

    for lp in &report.loops {
        let _ = writeln!(out, "\n[{}]", lp.loop_id);
        match &lp.last_entry {
            Some(entry) => {
                let _ = writeln!(
                    out,
                    "  last: iteration {} {} (promise {}, completion_ok={})",
                    entry.iteration,
                    entry.decision.as_str(),
                    if entry.promise.matched { "matched" } else { "missing" },
                    entry.completion_ok,
                );
            }
            None => {
                let _ = writeln!(out, "  last: no iterations recorded");
            }
        }
        let view = &lp.ledger;
        let _ = writeln!(
            out,
            "  ledger: {} events, {} iterations started, {} recoveries executed{}",
            view.events,
            view.iterations_started,
            view.recoveries_executed,
            if view.completed { ", complete" } else { "" },
        );
        if let Some(iteration) = lp.pending_approval {
            let _ = writeln!(
                out,
                "  approval pending for iteration {iteration} (superloop approve|reject --loop {})",
                lp.loop_id
            );
        }
        if let Some(cp) = &lp.rate_limit {
            let reset = cp
                .reset_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            let _ = writeln!(
                out,
                "  rate limited: role '{}' iteration {} (resets {reset})",
                cp.role, cp.iteration
            );
        }
    }
    out
}
