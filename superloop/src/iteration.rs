//! Orchestration for one iteration of a loop.
//!
//! Runs every role in order, extracts the completion promise from the final
//! role's message, evaluates gates and, when the checklist is still open,
//! checks for progress. The caller decides what the result means for the run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::completion::{Verdict, verdict};
use crate::core::promise::check_promise;
use crate::core::session_program::parse_program;
use crate::core::stuck::StuckState;
use crate::core::types::{GateOutcomes, PromiseOutcome, RoleExit};
use crate::error::SuperloopError;
use crate::gates::{GateContext, evaluate_gates};
use crate::io::config::{LoopConfig, RoleConfig, RunnerConfig};
use crate::io::events::{EventKind, EventLedger};
use crate::io::evidence::{ArtifactMeta, describe_artifacts};
use crate::io::executor::{RoleExecutor, RoleRequest, RoleRun};
use crate::io::paths::LoopPaths;
use crate::io::process::role_log_path;
use crate::io::progress::{ProgressRequest, check_progress};
use crate::io::prompt::{ContextSection, RolePromptInput, read_prompt_body, render_role_prompt};
use crate::io::test_gate::TestRunner;
use crate::session::{ProgramRun, run_program};

pub struct IterationContext<'a> {
    pub repo: &'a Path,
    pub runner: &'a RunnerConfig,
    pub loop_cfg: &'a LoopConfig,
    pub paths: &'a LoopPaths,
    pub ledger: &'a EventLedger,
    pub iteration: u32,
}

/// Result of [`run_iteration`].
#[derive(Debug, Clone)]
pub enum IterationOutcome {
    /// A role did not succeed; gates were not evaluated.
    RoleStopped { role: String, exit: RoleExit },
    Evaluated(Box<EvaluatedIteration>),
}

#[derive(Debug, Clone)]
pub struct EvaluatedIteration {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub promise: PromiseOutcome,
    pub gates: GateOutcomes,
    pub verdict: Verdict,
    /// Set when the progress detector ran.
    pub stuck: Option<StuckState>,
    /// Gate status files and this iteration's role artifacts.
    pub artifacts: Vec<ArtifactMeta>,
    pub synopsis: String,
}

/// Execute one iteration from its first role.
#[instrument(skip_all, fields(loop_id = %ctx.loop_cfg.id, iteration = ctx.iteration))]
pub fn run_iteration<E, R>(
    executor: &E,
    test_runner: &R,
    ctx: &IterationContext<'_>,
) -> Result<IterationOutcome>
where
    E: RoleExecutor + ?Sized,
    R: TestRunner + ?Sized,
{
    let started_at = Utc::now();
    let run_id = ctx.ledger.run_id().to_string();
    let iteration_dir = ctx.paths.iteration_dir(&run_id, ctx.iteration);
    fs::create_dir_all(&iteration_dir)
        .with_context(|| format!("create iteration dir {}", iteration_dir.display()))?;
    ctx.ledger.emit(EventKind::IterationStart, ctx.iteration, |e| {
        e.data(json!({ "max_iterations": ctx.loop_cfg.max_iterations }))
    })?;
    info!(run_id = %run_id, "iteration started");

    let mut final_message = None;
    for role in &ctx.loop_cfg.roles {
        ctx.ledger.emit(EventKind::RoleStart, ctx.iteration, |e| e.role(role.name.clone()))?;
        let run = run_role(executor, ctx, role, &iteration_dir)?;
        emit_role_end(ctx, &role.name, &run.exit)?;
        if !run.exit.is_success() {
            return Ok(IterationOutcome::RoleStopped {
                role: role.name.clone(),
                exit: run.exit,
            });
        }
        final_message = run.last_message;
    }

    let promise = check_promise(&ctx.loop_cfg.completion_promise, final_message.as_deref());
    ctx.ledger.emit(EventKind::PromiseChecked, ctx.iteration, |e| {
        let e = e
            .status(if promise.matched { "matched" } else { "missing" })
            .data(json!({ "expected": promise.expected }));
        match &promise.text {
            Some(text) => e.message(text.clone()),
            None => e,
        }
    })?;

    let report = evaluate_gates(
        test_runner,
        &GateContext {
            repo: ctx.repo,
            loop_cfg: ctx.loop_cfg,
            paths: ctx.paths,
            ledger: ctx.ledger,
            output_limit_bytes: ctx.runner.output_limit_bytes,
            iteration: ctx.iteration,
            promise: &promise,
            now: Utc::now(),
        },
    )?;
    let verdict = verdict(&promise, &report.outcomes, &ctx.loop_cfg.gate_policy());

    let stuck = if verdict == Verdict::Continue
        && ctx.loop_cfg.stuck.enabled
        && !report.outcomes.checklist.ok
    {
        let unchecked = report.unchecked();
        let state = check_progress(&ProgressRequest {
            repo: ctx.repo,
            config: &ctx.loop_cfg.stuck,
            paths: ctx.paths,
            loop_id: &ctx.loop_cfg.id,
            run_id: &run_id,
            iteration: ctx.iteration,
            unchecked: &unchecked,
            now: Utc::now(),
        })?;
        ctx.ledger.emit(EventKind::StuckCheck, ctx.iteration, |e| {
            e.status(state.reason.as_str()).data(json!({
                "streak": state.streak,
                "threshold": state.threshold,
                "code_signature": state.code_signature,
                "test_signature": state.test_signature,
            }))
        })?;
        Some(state)
    } else {
        None
    };

    let artifacts = collect_artifacts(ctx.repo, ctx.paths, &iteration_dir)?;
    Ok(IterationOutcome::Evaluated(Box::new(EvaluatedIteration {
        started_at,
        ended_at: Utc::now(),
        promise,
        gates: report.outcomes,
        verdict,
        stuck,
        artifacts,
        synopsis: report.synopsis,
    })))
}

fn run_role<E: RoleExecutor + ?Sized>(
    executor: &E,
    ctx: &IterationContext<'_>,
    role: &RoleConfig,
    iteration_dir: &Path,
) -> Result<RoleRun> {
    let base = RoleRequest {
        name: role.name.clone(),
        repo: ctx.repo.to_path_buf(),
        prompt: String::new(),
        prompt_file: iteration_dir.join(format!("{}.prompt.md", role.name)),
        last_message_file: iteration_dir.join(format!("{}.last_message.txt", role.name)),
        log_path: role_log_path(iteration_dir, &role.name),
        max_timeout: role.max_timeout(ctx.runner),
        inactivity_timeout: role.inactivity_timeout(ctx.runner),
    };

    let Some(program_path) = &role.program else {
        let body = read_prompt_body(ctx.repo, &role.prompt)?;
        let prompt = render_prompt(ctx, &role.name, &body, &[])?;
        return executor.run_role(&RoleRequest { prompt, ..base });
    };

    let source = read_prompt_body(ctx.repo, program_path)?;
    let program = parse_program(&source).map_err(|err| {
        SuperloopError::Config(format!("role '{}' program {program_path}: {err:#}", role.name))
    })?;
    run_program(
        executor,
        &ProgramRun {
            role: &role.name,
            program: &program,
            base: &base,
            iteration_dir,
            ledger: ctx.ledger,
            iteration: ctx.iteration,
        },
        |decl, context| {
            let body = read_prompt_body(ctx.repo, &decl.prompt)?;
            render_prompt(ctx, &format!("{}.{}", role.name, decl.name), &body, context)
        },
    )
}

fn render_prompt(
    ctx: &IterationContext<'_>,
    role: &str,
    body: &str,
    context: &[ContextSection],
) -> Result<String> {
    let state_dir = ctx
        .paths
        .dir
        .strip_prefix(ctx.repo)
        .unwrap_or(&ctx.paths.dir)
        .display()
        .to_string();
    render_role_prompt(&RolePromptInput {
        role,
        loop_id: &ctx.loop_cfg.id,
        iteration: ctx.iteration,
        max_iterations: ctx.loop_cfg.max_iterations,
        spec_file: &ctx.loop_cfg.spec_file,
        completion_promise: &ctx.loop_cfg.completion_promise,
        state_dir: &state_dir,
        body,
        context,
    })
}

fn emit_role_end(ctx: &IterationContext<'_>, role: &str, exit: &RoleExit) -> Result<()> {
    ctx.ledger.emit(EventKind::RoleEnd, ctx.iteration, |e| {
        e.role(role)
            .status(exit.label())
            .data(json!({ "exit_code": exit.code() }))
    })?;
    match exit {
        RoleExit::TimedOut(kind) => {
            warn!(role, kind = kind.as_str(), "role timed out");
            ctx.ledger.emit(EventKind::RoleTimeout, ctx.iteration, |e| {
                e.role(role).status(kind.as_str())
            })
        }
        RoleExit::RateLimited(info) => {
            warn!(role, reset_at = ?info.reset_at, "role rate limited");
            ctx.ledger.emit(EventKind::RateLimited, ctx.iteration, |e| {
                e.role(role).message(info.message.clone()).data(json!({
                    "reset_at": info.reset_at,
                    "matched_line": info.matched_line,
                }))
            })
        }
        RoleExit::Success | RoleExit::Failed(_) => Ok(()),
    }
}

fn collect_artifacts(repo: &Path, paths: &LoopPaths, iteration_dir: &Path) -> Result<Vec<ArtifactMeta>> {
    let mut files: Vec<PathBuf> = vec![
        paths.gate_summary.clone(),
        paths.checklist_status.clone(),
        paths.test_status.clone(),
        paths.test_output.clone(),
        paths.validation_status.clone(),
        paths.evidence.clone(),
        paths.stuck.clone(),
    ];
    let mut role_files = Vec::new();
    for entry in fs::read_dir(iteration_dir)
        .with_context(|| format!("read iteration dir {}", iteration_dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() {
            role_files.push(path);
        }
    }
    role_files.sort();
    files.extend(role_files);
    describe_artifacts(repo, &files)
}
