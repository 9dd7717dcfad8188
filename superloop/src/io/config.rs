//! Superloop configuration stored under `.superloop/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::recovery_policy::RecoveryPolicy;
use crate::core::types::GatePolicy;
use crate::error::SuperloopError;

/// Upper bound for every timeout setting (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// sensible values; `validate` rejects anything the controller cannot run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SuperloopConfig {
    pub runner: RunnerConfig,
    pub loops: Vec<LoopConfig>,
}

/// How the prompt reaches a role process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// Prompt bytes are written to stdin.
    #[default]
    Stdin,
    /// Stdin is left unconnected; the role reads `{prompt_file}`.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Role command argv. Supports `{repo}`, `{prompt_file}` and `{last_message_file}`.
    pub command: Vec<String>,
    /// Alternative argv selected by `run --fast`.
    pub fast_command: Option<Vec<String>>,
    pub prompt_mode: PromptMode,
    /// Hard ceiling per role, measured from process start.
    pub max_timeout_secs: u64,
    /// Kill a role after this long without an output line.
    pub inactivity_timeout_secs: u64,
    /// Delay between SIGTERM and SIGKILL.
    pub kill_grace_secs: u64,
    /// Truncate captured command output (tests, validation, recovery) beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Echo role output to the parent's stdout.
    pub forward_output: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--output-last-message".to_string(),
                "{last_message_file}".to_string(),
                "-".to_string(),
            ],
            fast_command: None,
            prompt_mode: PromptMode::Stdin,
            max_timeout_secs: 60 * 60,
            inactivity_timeout_secs: 10 * 60,
            kill_grace_secs: 5,
            output_limit_bytes: 1_000_000,
            forward_output: true,
        }
    }
}

impl RunnerConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Argv for this invocation.
    pub fn argv(&self, fast: bool) -> &[String] {
        match (&self.fast_command, fast) {
            (Some(fast_command), true) => fast_command,
            _ => &self.command,
        }
    }
}

/// One loop (`[[loops]]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub id: String,
    /// Feature spec handed to roles; relative to the repository root.
    pub spec_file: String,
    pub max_iterations: u32,
    pub completion_promise: String,
    pub roles: Vec<RoleConfig>,
    pub tests: TestsConfig,
    pub checklist: ChecklistConfig,
    pub validation: ValidationConfig,
    pub evidence: EvidenceConfig,
    pub approval: ApprovalConfig,
    pub stuck: StuckConfig,
    pub recovery: RecoveryPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            id: "main".to_string(),
            spec_file: "SPEC.md".to_string(),
            max_iterations: 20,
            completion_promise: "SUPERLOOP_COMPLETE".to_string(),
            roles: Vec::new(),
            tests: TestsConfig::default(),
            checklist: ChecklistConfig::default(),
            validation: ValidationConfig::default(),
            evidence: EvidenceConfig::default(),
            approval: ApprovalConfig::default(),
            stuck: StuckConfig::default(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl LoopConfig {
    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            validation_required: self.validation.enabled && self.validation.required,
            evidence_required: self.evidence.enabled && self.evidence.required,
            approval_required: self.approval.required,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoleConfig {
    pub name: String,
    /// Prompt file relative to the repository root.
    pub prompt: String,
    /// Optional session program; when set the role runs its sessions instead of `prompt`.
    pub program: Option<String>,
    pub max_timeout_secs: Option<u64>,
    pub inactivity_timeout_secs: Option<u64>,
}

impl RoleConfig {
    pub fn max_timeout(&self, runner: &RunnerConfig) -> Duration {
        Duration::from_secs(self.max_timeout_secs.unwrap_or(runner.max_timeout_secs))
    }

    pub fn inactivity_timeout(&self, runner: &RunnerConfig) -> Duration {
        Duration::from_secs(
            self.inactivity_timeout_secs
                .unwrap_or(runner.inactivity_timeout_secs),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    #[default]
    Disabled,
    Every,
    OnPromise,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    pub mode: TestMode,
    /// Shell commands run sequentially in the repository root.
    pub commands: Vec<String>,
    /// Timeout per command.
    pub timeout_secs: u64,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            mode: TestMode::Disabled,
            commands: Vec::new(),
            timeout_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChecklistConfig {
    /// Glob patterns relative to the repository root. Empty disables the gate.
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub required: bool,
    pub checks: Vec<ValidationCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationCheck {
    pub name: String,
    /// Shell command; receives the result path in `SUPERLOOP_RESULT_FILE`.
    pub command: String,
    /// Result document path relative to the repository root. Defaults to
    /// `.superloop/loops/<id>/validation/<name>.json`.
    pub result_file: Option<String>,
    /// Advisory checks are reported but never fail the gate.
    pub blocking: bool,
    pub timeout_secs: u64,
}

impl Default for ValidationCheck {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            result_file: None,
            blocking: true,
            timeout_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvidenceConfig {
    pub enabled: bool,
    pub required: bool,
    /// Artifact globs relative to the repository root.
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApprovalConfig {
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StuckConfig {
    pub enabled: bool,
    pub threshold: u32,
    /// Globs excluded from the code signature (in addition to `.superloop/**`).
    pub ignore: Vec<String>,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 3,
            ignore: Vec::new(),
        }
    }
}

impl SuperloopConfig {
    /// Collect every problem, then fail once with all of them.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.runner.command.is_empty() || self.runner.command[0].trim().is_empty() {
            problems.push("runner.command must be a non-empty array".to_string());
        }
        if let Some(fast) = &self.runner.fast_command
            && (fast.is_empty() || fast[0].trim().is_empty())
        {
            problems.push("runner.fast_command must be a non-empty array when set".to_string());
        }
        check_secs("runner.max_timeout_secs", self.runner.max_timeout_secs, &mut problems);
        check_secs(
            "runner.inactivity_timeout_secs",
            self.runner.inactivity_timeout_secs,
            &mut problems,
        );
        if self.runner.kill_grace_secs > MAX_TIMEOUT_SECS {
            problems.push(format!("runner.kill_grace_secs must be <= {MAX_TIMEOUT_SECS}"));
        }
        if self.runner.output_limit_bytes == 0 {
            problems.push("runner.output_limit_bytes must be > 0".to_string());
        }
        if self.loops.is_empty() {
            problems.push("at least one [[loops]] entry is required".to_string());
        }

        let mut loop_ids = HashSet::new();
        for lp in &self.loops {
            let at = format!("loop '{}'", lp.id);
            if lp.id.trim().is_empty() {
                problems.push("loop id must be non-empty".to_string());
            } else if !lp
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                problems.push(format!("{at}: id may only contain [A-Za-z0-9_-]"));
            }
            if !loop_ids.insert(lp.id.as_str()) {
                problems.push(format!("{at}: duplicate loop id"));
            }
            if lp.max_iterations == 0 {
                problems.push(format!("{at}: max_iterations must be > 0"));
            }
            if lp.completion_promise.trim().is_empty() {
                problems.push(format!("{at}: completion_promise must be non-empty"));
            }
            validate_roles(lp, &at, &mut problems);

            if lp.tests.mode != TestMode::Disabled && lp.tests.commands.is_empty() {
                problems.push(format!("{at}: tests.commands must be non-empty when tests are enabled"));
            }
            check_secs(&format!("{at}: tests.timeout_secs"), lp.tests.timeout_secs, &mut problems);
            if lp.validation.enabled {
                if lp.validation.checks.is_empty() {
                    problems.push(format!("{at}: validation.checks must be non-empty when enabled"));
                }
                let mut names = HashSet::new();
                for check in &lp.validation.checks {
                    if check.name.trim().is_empty() || check.command.trim().is_empty() {
                        problems.push(format!("{at}: validation checks need a name and a command"));
                    }
                    if !names.insert(check.name.as_str()) {
                        problems.push(format!("{at}: duplicate validation check '{}'", check.name));
                    }
                    check_secs(
                        &format!("{at}: validation check '{}' timeout_secs", check.name),
                        check.timeout_secs,
                        &mut problems,
                    );
                }
            }
            if lp.stuck.enabled && lp.stuck.threshold < 2 {
                problems.push(format!("{at}: stuck.threshold must be >= 2"));
            }
            let recovery = &lp.recovery;
            if !(0.0..=1.0).contains(&recovery.min_confidence) {
                problems.push(format!("{at}: recovery.min_confidence must be within 0.0..=1.0"));
            }
            check_secs(&format!("{at}: recovery.timeout_secs"), recovery.timeout_secs, &mut problems);

            let globs = lp
                .checklist
                .patterns
                .iter()
                .chain(&lp.evidence.artifacts)
                .chain(&lp.stuck.ignore)
                .chain(&recovery.require_human);
            for pattern in globs {
                if let Err(err) = glob::Pattern::new(pattern) {
                    problems.push(format!("{at}: invalid glob '{pattern}': {err}"));
                }
            }
        }

        if problems.is_empty() {
            return Ok(());
        }
        Err(SuperloopError::Config(problems.join("; ")).into())
    }

    pub fn loop_by_id(&self, id: &str) -> Option<(usize, &LoopConfig)> {
        self.loops.iter().enumerate().find(|(_, lp)| lp.id == id)
    }
}

fn validate_roles(lp: &LoopConfig, at: &str, problems: &mut Vec<String>) {
    if lp.roles.is_empty() {
        problems.push(format!("{at}: roles must be non-empty"));
    }
    let mut names = HashSet::new();
    for role in &lp.roles {
        if role.name.trim().is_empty() {
            problems.push(format!("{at}: role name must be non-empty"));
        }
        if !names.insert(role.name.as_str()) {
            problems.push(format!("{at}: duplicate role '{}'", role.name));
        }
        if role.prompt.trim().is_empty() && role.program.is_none() {
            problems.push(format!("{at}: role '{}' needs a prompt or a program", role.name));
        }
        if let Some(secs) = role.max_timeout_secs {
            check_secs(&format!("{at}: role '{}' max_timeout_secs", role.name), secs, problems);
        }
        if let Some(secs) = role.inactivity_timeout_secs {
            check_secs(
                &format!("{at}: role '{}' inactivity_timeout_secs", role.name),
                secs,
                problems,
            );
        }
    }
}

fn check_secs(name: &str, secs: u64, problems: &mut Vec<String>) {
    if secs == 0 {
        problems.push(format!("{name} must be > 0"));
    } else if secs > MAX_TIMEOUT_SECS {
        problems.push(format!("{name} must be <= {MAX_TIMEOUT_SECS}"));
    }
}

/// Load and validate config from a TOML file. A missing file is a config error.
pub fn load_config(path: &Path) -> Result<SuperloopConfig> {
    if !path.exists() {
        return Err(SuperloopError::Config(format!(
            "{} not found (run `superloop init`)",
            path.display()
        ))
        .into());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SuperloopConfig = toml::from_str(&contents)
        .map_err(|err| SuperloopError::Config(format!("parse {}: {err}", path.display())))?;
    cfg.validate()?;
    debug!(loops = cfg.loops.len(), "config loaded");
    Ok(cfg)
}
