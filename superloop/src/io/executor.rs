//! Role executor abstraction.
//!
//! The [`RoleExecutor`] trait decouples the loop controller from the actual
//! agent backend (any configured command). Tests use scripted executors that
//! return predetermined exits and messages without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::types::RoleExit;
use crate::io::atomic::{remove_if_exists, write_atomic};
use crate::io::config::{PromptMode, RunnerConfig};
use crate::io::process::{SuperviseRequest, supervise};

/// Parameters for one role (or session) invocation.
#[derive(Debug, Clone)]
pub struct RoleRequest {
    /// Role name, or `<role>.<session>` inside a session program.
    pub name: String,
    pub repo: PathBuf,
    pub prompt: String,
    /// Where the prompt is materialized for `{prompt_file}`.
    pub prompt_file: PathBuf,
    /// Where the role writes (or the executor stores) its final message.
    pub last_message_file: PathBuf,
    pub log_path: PathBuf,
    pub max_timeout: Duration,
    pub inactivity_timeout: Duration,
}

/// Outcome of a role invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRun {
    pub exit: RoleExit,
    pub last_message: Option<String>,
}

/// Abstraction over agent execution backends.
pub trait RoleExecutor: Sync {
    fn run_role(&self, request: &RoleRequest) -> Result<RoleRun>;
}

/// Executor that spawns the configured runner command under the supervisor.
#[derive(Debug, Clone)]
pub struct CommandRoleExecutor {
    argv: Vec<String>,
    prompt_mode: PromptMode,
    kill_grace: Duration,
    forward_output: bool,
}

impl CommandRoleExecutor {
    pub fn new(runner: &RunnerConfig, fast: bool) -> Self {
        Self {
            argv: runner.argv(fast).to_vec(),
            prompt_mode: runner.prompt_mode,
            kill_grace: runner.kill_grace(),
            forward_output: runner.forward_output,
        }
    }
}

impl RoleExecutor for CommandRoleExecutor {
    #[instrument(skip_all, fields(role = %request.name))]
    fn run_role(&self, request: &RoleRequest) -> Result<RoleRun> {
        info!(
            max_timeout_secs = request.max_timeout.as_secs(),
            inactivity_timeout_secs = request.inactivity_timeout.as_secs(),
            "starting role"
        );
        write_atomic(&request.prompt_file, request.prompt.as_bytes())?;
        remove_if_exists(&request.last_message_file)?;

        let outcome = supervise(&SuperviseRequest {
            argv: render_argv(&self.argv, request),
            workdir: request.repo.clone(),
            stdin: match self.prompt_mode {
                PromptMode::Stdin => Some(request.prompt.clone().into_bytes()),
                PromptMode::File => None,
            },
            log_path: request.log_path.clone(),
            max_timeout: request.max_timeout,
            inactivity_timeout: request.inactivity_timeout,
            kill_grace: self.kill_grace,
            forward_output: self.forward_output,
        })
        .with_context(|| format!("supervise role '{}'", request.name))?;

        let mut last_message = read_last_message(&request.last_message_file)?;
        if last_message.is_none() && outcome.exit.is_success() && !outcome.tail.is_empty() {
            debug!("role wrote no last message, storing output tail");
            write_atomic(&request.last_message_file, outcome.tail.as_bytes())?;
            last_message = Some(outcome.tail);
        }
        if !outcome.exit.is_success() {
            warn!(exit = outcome.exit.label(), code = outcome.exit.code(), "role did not succeed");
        }

        Ok(RoleRun {
            exit: outcome.exit,
            last_message,
        })
    }
}

/// Substitute `{repo}`, `{prompt_file}` and `{last_message_file}` in each argument.
pub fn render_argv(template: &[String], request: &RoleRequest) -> Vec<String> {
    let repo = request.repo.display().to_string();
    let prompt_file = request.prompt_file.display().to_string();
    let last_message_file = request.last_message_file.display().to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{repo}", &repo)
                .replace("{prompt_file}", &prompt_file)
                .replace("{last_message_file}", &last_message_file)
        })
        .collect()
}

/// Read a last-message file; missing or blank is `None`.
pub fn read_last_message(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read last message {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(contents))
}
