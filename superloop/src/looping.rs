//! Loop controller: per-loop state machine and multi-loop sequencing for `superloop run`.

use std::path::Path;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::completion::Verdict;
use crate::core::types::{RoleExit, TimeoutKind};
use crate::error::SuperloopError;
use crate::io::approval::{
    ApprovalCandidate, ApprovalRequest, ApprovalStatus, consume, load_approval, write_approval,
};
use crate::io::config::{LoopConfig, SuperloopConfig};
use crate::io::events::{EventKind, EventLedger};
use crate::io::executor::RoleExecutor;
use crate::io::paths::{LoopPaths, SuperloopPaths};
use crate::io::run_state::{
    RateLimitCheckpoint, RunState, load_run_state, write_rate_limit_checkpoint, write_run_state,
};
use crate::io::run_summary::{IterationDecision, IterationRecord, StuckSnapshot, append_entry};
use crate::io::test_gate::TestRunner;
use crate::iteration::{EvaluatedIteration, IterationContext, IterationOutcome, run_iteration};
use crate::recovery::{RecoveryContext, RecoveryOutcome, attempt_recovery};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run only this loop.
    pub loop_id: Option<String>,
}

/// Reason why `run_loops` stopped. Every variant leaves state resumable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every selected loop completed.
    AllComplete,
    /// A candidate passed every gate and waits on `superloop approve|reject`.
    AwaitingApproval { loop_id: String, iteration: u32 },
    /// The progress detector reached its threshold.
    Stuck {
        loop_id: String,
        iteration: u32,
        streak: u32,
    },
    MaxIterations { loop_id: String, max_iterations: u32 },
    RoleTimeout {
        loop_id: String,
        iteration: u32,
        role: String,
        kind: TimeoutKind,
    },
    RateLimited {
        loop_id: String,
        iteration: u32,
        role: String,
        reset_at: Option<DateTime<Utc>>,
    },
}

impl LoopStop {
    /// One-line instruction for the operator.
    pub fn resume_hint(&self) -> String {
        match self {
            LoopStop::AllComplete => "all loops complete".to_string(),
            LoopStop::AwaitingApproval { loop_id, iteration } => format!(
                "loop '{loop_id}' iteration {iteration} awaits approval; run `superloop approve --loop {loop_id}` or `superloop reject --loop {loop_id}`, then `superloop run`"
            ),
            LoopStop::Stuck {
                loop_id,
                iteration,
                streak,
            } => format!(
                "loop '{loop_id}' is stuck after {streak} iterations without progress (see .superloop/loops/{loop_id}/stuck-report.md); resolve it and run `superloop run` to resume from iteration {}",
                iteration + 1
            ),
            LoopStop::MaxIterations {
                loop_id,
                max_iterations,
            } => format!(
                "loop '{loop_id}' reached max_iterations ({max_iterations}); raise it in .superloop/config.toml and run `superloop run`"
            ),
            LoopStop::RoleTimeout {
                loop_id,
                iteration,
                role,
                kind,
            } => format!(
                "role '{role}' hit the {} timeout in loop '{loop_id}' iteration {iteration}; run `superloop run` to retry the iteration",
                kind.as_str()
            ),
            LoopStop::RateLimited {
                loop_id,
                iteration,
                role,
                reset_at,
            } => {
                let when = reset_at
                    .map(|at| format!("after {}", at.to_rfc3339()))
                    .unwrap_or_else(|| "once the limit resets".to_string());
                format!(
                    "role '{role}' was rate limited in loop '{loop_id}' iteration {iteration}; run `superloop run` {when}"
                )
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub iterations_run: u32,
    pub stop: LoopStop,
}

/// Run loops from the persisted position until they complete or pause.
///
/// Role process failures are returned as [`SuperloopError::RoleProcessFailure`]
/// after the recovery engine had its chance; everything else that stops a run
/// is a [`LoopStop`].
#[instrument(skip_all, fields(repo = %repo.display()))]
pub fn run_loops<E, R>(
    repo: &Path,
    config: &SuperloopConfig,
    executor: &E,
    test_runner: &R,
    options: &RunOptions,
) -> Result<RunOutcome>
where
    E: RoleExecutor + ?Sized,
    R: TestRunner + ?Sized,
{
    let paths = SuperloopPaths::new(repo);
    let mut state = load_run_state(&paths.state)?;
    position(&mut state, config, options.loop_id.as_deref())?;

    let mut iterations_run = 0u32;
    while let Some(loop_cfg) = config.loops.get(state.loop_index) {
        let next_loop_id = match &options.loop_id {
            Some(_) => None,
            None => config.loops.get(state.loop_index + 1).map(|lp| lp.id.clone()),
        };
        let mut controller = LoopController {
            repo,
            config,
            loop_cfg,
            paths: paths.loop_paths(&loop_cfg.id),
            run_state_path: &paths.state,
            state: &mut state,
            next_loop_id,
        };
        match controller.run(executor, test_runner, &mut iterations_run)? {
            Some(stop) => return Ok(RunOutcome { iterations_run, stop }),
            None if options.loop_id.is_some() => break,
            None => {}
        }
    }

    Ok(RunOutcome {
        iterations_run,
        stop: LoopStop::AllComplete,
    })
}

/// Point `state` at the loop to run.
fn position(state: &mut RunState, config: &SuperloopConfig, only: Option<&str>) -> Result<()> {
    if let Some(id) = only {
        let (idx, _) = config
            .loop_by_id(id)
            .ok_or_else(|| SuperloopError::Config(format!("unknown loop '{id}'")))?;
        if state.current_loop_id.as_deref() != Some(id) || state.loop_index != idx {
            *state = RunState {
                loop_index: idx,
                ..RunState::default()
            };
        }
        return Ok(());
    }

    // Loops may have been reordered since the state was written.
    if let Some(id) = state.current_loop_id.clone()
        && let Some((idx, _)) = config.loop_by_id(&id)
    {
        state.loop_index = idx;
        return Ok(());
    }
    if state.loop_index >= config.loops.len() || state.current_loop_id.is_some() {
        info!("starting a new cycle from the first loop");
        *state = RunState::default();
    }
    Ok(())
}

struct LoopController<'a> {
    repo: &'a Path,
    config: &'a SuperloopConfig,
    loop_cfg: &'a LoopConfig,
    paths: LoopPaths,
    run_state_path: &'a Path,
    state: &'a mut RunState,
    next_loop_id: Option<String>,
}

impl LoopController<'_> {
    /// `None` when the loop completed and the next one may start.
    fn run<E, R>(
        &mut self,
        executor: &E,
        test_runner: &R,
        iterations_run: &mut u32,
    ) -> Result<Option<LoopStop>>
    where
        E: RoleExecutor + ?Sized,
        R: TestRunner + ?Sized,
    {
        let loop_id = self.loop_cfg.id.clone();
        self.state.active = true;
        self.state.current_loop_id = Some(loop_id.clone());
        let run_id = self.state.ensure_run_id(Utc::now());
        self.save()?;

        let ledger = EventLedger::new(&self.paths.events, &loop_id, &run_id);
        ledger.emit(EventKind::LoopStart, self.state.iteration, |e| {
            e.data(json!({ "loop_index": self.state.loop_index }))
        })?;
        info!(loop_id = %loop_id, run_id = %run_id, iteration = self.state.iteration, "loop started");

        if let Some(request) = load_approval(&self.paths.approval)? {
            match request.status {
                ApprovalStatus::Pending => {
                    return Ok(Some(LoopStop::AwaitingApproval {
                        loop_id,
                        iteration: request.iteration,
                    }));
                }
                ApprovalStatus::Approved => {
                    self.replay_decision(&ledger, request)?;
                    self.complete(&ledger)?;
                    return Ok(None);
                }
                ApprovalStatus::Rejected => {
                    self.replay_decision(&ledger, request)?;
                    self.state.iteration += 1;
                    self.save()?;
                }
            }
        }

        loop {
            let iteration = self.state.iteration;
            if iteration > self.loop_cfg.max_iterations {
                let max_iterations = self.loop_cfg.max_iterations;
                self.state.iteration = max_iterations + 1;
                self.save()?;
                ledger.emit(EventKind::MaxIterationsReached, iteration, |e| {
                    e.data(json!({ "max_iterations": max_iterations }))
                })?;
                warn!(loop_id = %loop_id, max_iterations, "max iterations reached");
                return Ok(Some(LoopStop::MaxIterations {
                    loop_id,
                    max_iterations,
                }));
            }

            let outcome = run_iteration(
                executor,
                test_runner,
                &IterationContext {
                    repo: self.repo,
                    runner: &self.config.runner,
                    loop_cfg: self.loop_cfg,
                    paths: &self.paths,
                    ledger: &ledger,
                    iteration,
                },
            )?;
            *iterations_run += 1;

            let ev = match outcome {
                IterationOutcome::Evaluated(ev) => ev,
                IterationOutcome::RoleStopped { role, exit } => {
                    return self.role_stopped(&ledger, iteration, role, exit);
                }
            };

            match ev.verdict {
                Verdict::Complete => {
                    self.record(&ledger, iteration, &ev, IterationDecision::Complete)?;
                    self.complete(&ledger)?;
                    return Ok(None);
                }
                Verdict::AwaitApproval => {
                    self.request_approval(&ledger, iteration, &ev)?;
                    return Ok(Some(LoopStop::AwaitingApproval { loop_id, iteration }));
                }
                Verdict::Continue => {}
            }

            if let Some(stuck) = ev.stuck.as_ref().filter(|s| s.is_stuck()) {
                self.record(&ledger, iteration, &ev, IterationDecision::Stuck)?;
                ledger.emit(EventKind::StuckHalt, iteration, |e| {
                    e.status(stuck.reason.as_str())
                        .message(format!("no progress for {} iterations", stuck.streak))
                })?;
                self.state.iteration += 1;
                self.save()?;
                return Ok(Some(LoopStop::Stuck {
                    loop_id,
                    iteration,
                    streak: stuck.streak,
                }));
            }

            self.record(&ledger, iteration, &ev, IterationDecision::Continue)?;
            self.consult_recovery(&ledger, iteration)?;
            self.state.iteration += 1;
            self.save()?;
        }
    }

    fn role_stopped(
        &mut self,
        ledger: &EventLedger,
        iteration: u32,
        role: String,
        exit: RoleExit,
    ) -> Result<Option<LoopStop>> {
        let loop_id = self.loop_cfg.id.clone();
        self.save()?;
        match exit {
            RoleExit::TimedOut(kind) => Ok(Some(LoopStop::RoleTimeout {
                loop_id,
                iteration,
                role,
                kind,
            })),
            RoleExit::RateLimited(info) => {
                write_rate_limit_checkpoint(
                    &self.paths.rate_limit,
                    &RateLimitCheckpoint {
                        loop_id: loop_id.clone(),
                        run_id: ledger.run_id().to_string(),
                        iteration,
                        role: role.clone(),
                        reset_at: info.reset_at,
                        message: info.message,
                        matched_line: info.matched_line,
                        recorded_at: Utc::now(),
                    },
                )?;
                Ok(Some(LoopStop::RateLimited {
                    loop_id,
                    iteration,
                    role,
                    reset_at: info.reset_at,
                }))
            }
            RoleExit::Failed(code) => {
                self.consult_recovery(ledger, iteration)?;
                Err(SuperloopError::RoleProcessFailure { role, code }.into())
            }
            RoleExit::Success => bail!("role '{role}' stopped the iteration without failing"),
        }
    }

    fn consult_recovery(&self, ledger: &EventLedger, iteration: u32) -> Result<RecoveryOutcome> {
        let outcome = attempt_recovery(&RecoveryContext {
            repo: self.repo,
            policy: &self.loop_cfg.recovery,
            paths: &self.paths,
            ledger,
            loop_id: &self.loop_cfg.id,
            iteration,
            output_limit_bytes: self.config.runner.output_limit_bytes,
            now: Utc::now(),
        })?;
        if outcome != RecoveryOutcome::NoProposal {
            info!(outcome = ?outcome, "recovery consulted");
        }
        Ok(outcome)
    }

    fn record(
        &self,
        ledger: &EventLedger,
        iteration: u32,
        ev: &EvaluatedIteration,
        decision: IterationDecision,
    ) -> Result<()> {
        let entry = IterationRecord {
            run_id: ledger.run_id().to_string(),
            iteration,
            started_at: ev.started_at,
            ended_at: ev.ended_at,
            promise: ev.promise.clone(),
            gates: ev.gates.clone(),
            stuck: ev.stuck.as_ref().map(|s| StuckSnapshot {
                streak: s.streak,
                threshold: s.threshold,
            }),
            completion_ok: decision == IterationDecision::Complete,
            decision,
            artifacts: ev.artifacts.clone(),
        };
        append_entry(&self.paths, &self.loop_cfg.id, entry, Utc::now())?;
        ledger.emit(EventKind::IterationEnd, iteration, |e| {
            e.status(decision.as_str()).message(ev.synopsis.clone())
        })
    }

    fn request_approval(
        &mut self,
        ledger: &EventLedger,
        iteration: u32,
        ev: &EvaluatedIteration,
    ) -> Result<()> {
        let request = ApprovalRequest {
            status: ApprovalStatus::Pending,
            loop_id: self.loop_cfg.id.clone(),
            run_id: ledger.run_id().to_string(),
            iteration,
            requested_at: Utc::now(),
            candidate: ApprovalCandidate {
                promise: ev.promise.clone(),
                gates: ev.gates.clone(),
                started_at: ev.started_at,
                ended_at: ev.ended_at,
                stuck: ev.stuck.as_ref().map(|s| StuckSnapshot {
                    streak: s.streak,
                    threshold: s.threshold,
                }),
                artifacts: ev.artifacts.clone(),
            },
            decision: None,
        };
        write_approval(&self.paths.approval, &request)?;
        ledger.emit(EventKind::ApprovalRequested, iteration, |e| {
            e.status("pending").message(ev.synopsis.clone())
        })?;
        ledger.emit(EventKind::IterationEnd, iteration, |e| {
            e.status("await_approval")
        })?;
        self.save()
    }

    /// Replay a decided request into the run summary and delete it.
    fn replay_decision(&mut self, ledger: &EventLedger, request: ApprovalRequest) -> Result<()> {
        let approved = request.status == ApprovalStatus::Approved;
        let mut gates = request.candidate.gates;
        gates.approval = request.status.gate_result();
        if let Some(decision) = &request.decision {
            gates.approval.detail = Some(match &decision.note {
                Some(note) => format!("{} by {}: {note}", request.status.as_str(), decision.by),
                None => format!("{} by {}", request.status.as_str(), decision.by),
            });
        }
        let decision = if approved {
            IterationDecision::Approved
        } else {
            IterationDecision::Rejected
        };
        let entry = IterationRecord {
            run_id: request.run_id,
            iteration: request.iteration,
            started_at: request.candidate.started_at,
            ended_at: request.candidate.ended_at,
            promise: request.candidate.promise,
            gates,
            stuck: request.candidate.stuck,
            completion_ok: approved,
            decision,
            artifacts: request.candidate.artifacts,
        };
        append_entry(&self.paths, &self.loop_cfg.id, entry, Utc::now())?;
        consume(&self.paths.approval)?;
        ledger.emit(EventKind::ApprovalConsumed, request.iteration, |e| {
            e.status(decision.as_str())
        })?;
        info!(iteration = request.iteration, decision = decision.as_str(), "approval consumed");
        Ok(())
    }

    fn complete(&mut self, ledger: &EventLedger) -> Result<()> {
        let iteration = self.state.iteration;
        ledger.emit(EventKind::LoopComplete, iteration, |e| e.status("complete"))?;
        info!(loop_id = %self.loop_cfg.id, iteration, "loop complete");
        self.state.complete_loop(self.next_loop_id.clone());
        self.save()
    }

    fn save(&mut self) -> Result<()> {
        write_run_state(self.run_state_path, self.state, Utc::now())
    }
}
