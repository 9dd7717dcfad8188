//! Test-only helpers: scratch git repositories, scripted executors and config builders.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::RoleExit;
use crate::io::config::{LoopConfig, RoleConfig, SuperloopConfig};
use crate::io::executor::{RoleExecutor, RoleRequest, RoleRun};
use crate::io::test_gate::{TestCommandResult, TestReport, TestRequest, TestRunner};

/// A git repository in a temp directory, removed on drop.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.root().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&[
            "-c",
            "user.name=Superloop Tests",
            "-c",
            "user.email=tests@superloop.invalid",
            "commit",
            "-q",
            "--allow-empty",
            "-m",
            message,
        ])
    }

    /// Write a prompt file for each role of `config` (`<role>: <prompt>` placeholders).
    pub fn write_role_prompts(&self, config: &SuperloopConfig) -> Result<()> {
        for lp in &config.loops {
            for role in &lp.roles {
                if !role.prompt.is_empty() {
                    self.write(&role.prompt, &format!("# {}\n", role.name))?;
                }
            }
        }
        Ok(())
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .context("run git")?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

/// One queued response of a [`ScriptedRoleExecutor`].
#[derive(Debug, Clone)]
pub struct ScriptedRole {
    /// Role (or `<role>.<session>`) this response answers.
    pub name: String,
    pub exit: RoleExit,
    pub message: Option<String>,
    /// Files written into the repository before returning, to simulate edits.
    pub writes: Vec<(String, String)>,
}

impl ScriptedRole {
    pub fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exit: RoleExit::Success,
            message: None,
            writes: Vec::new(),
        }
    }

    pub fn message(name: &str, message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::ok(name)
        }
    }

    pub fn exit(name: &str, exit: RoleExit) -> Self {
        Self {
            exit,
            ..Self::ok(name)
        }
    }

    pub fn with_write(mut self, rel: &str, contents: &str) -> Self {
        self.writes.push((rel.to_string(), contents.to_string()));
        self
    }
}

/// Executor returning queued responses matched by role name, in queue order.
#[derive(Debug, Default)]
pub struct ScriptedRoleExecutor {
    queue: Mutex<Vec<ScriptedRole>>,
    prompts: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRoleExecutor {
    pub fn new(responses: Vec<ScriptedRole>) -> Self {
        Self {
            queue: Mutex::new(responses),
            ..Self::default()
        }
    }

    /// Last prompt seen per name.
    pub fn prompts(&self) -> HashMap<String, String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or_default()
    }
}

impl RoleExecutor for ScriptedRoleExecutor {
    fn run_role(&self, request: &RoleRequest) -> Result<RoleRun> {
        let scripted = {
            let mut queue = self.queue.lock().map_err(|_| anyhow!("queue poisoned"))?;
            let idx = queue
                .iter()
                .position(|s| s.name == request.name)
                .ok_or_else(|| anyhow!("no scripted response for '{}'", request.name))?;
            queue.remove(idx)
        };
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.insert(request.name.clone(), request.prompt.clone());
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.name.clone());
        }

        for (rel, contents) in &scripted.writes {
            let path = request.repo.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents)?;
        }
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.log_path, format!("{} ran\n", request.name))?;
        if let Some(message) = &scripted.message {
            fs::write(&request.last_message_file, message)?;
        }

        Ok(RoleRun {
            exit: scripted.exit,
            last_message: scripted.message,
        })
    }
}

/// Test runner with a fixed verdict.
#[derive(Debug)]
pub struct FixedTestRunner {
    ok: bool,
    output: String,
    broken: Option<String>,
    calls: AtomicU32,
}

impl FixedTestRunner {
    pub fn passing() -> Self {
        Self {
            ok: true,
            output: "test result: ok\n".to_string(),
            broken: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(output: &str) -> Self {
        Self {
            ok: false,
            output: output.to_string(),
            ..Self::passing()
        }
    }

    /// Every run returns an error instead of a report.
    pub fn broken(message: &str) -> Self {
        Self {
            broken: Some(message.to_string()),
            ..Self::passing()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TestRunner for FixedTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.broken {
            bail!("{message}");
        }
        Ok(TestReport {
            ok: self.ok,
            commands: request
                .commands
                .iter()
                .map(|command| TestCommandResult {
                    command: command.clone(),
                    exit_code: Some(if self.ok { 0 } else { 1 }),
                    timed_out: false,
                    duration_ms: 1,
                })
                .collect(),
            output: self.output.clone(),
        })
    }
}

/// A loop with one `implementer` role, promise `DONE`, and every optional gate off.
pub fn loop_config(id: &str) -> LoopConfig {
    LoopConfig {
        id: id.to_string(),
        completion_promise: "DONE".to_string(),
        max_iterations: 5,
        roles: vec![role("implementer")],
        ..LoopConfig::default()
    }
}

pub fn role(name: &str) -> RoleConfig {
    RoleConfig {
        name: name.to_string(),
        prompt: format!(".superloop/roles/{name}.md"),
        ..RoleConfig::default()
    }
}

pub fn superloop_config(loops: Vec<LoopConfig>) -> SuperloopConfig {
    let mut config = SuperloopConfig {
        loops,
        ..SuperloopConfig::default()
    };
    config.runner.forward_output = false;
    config
}
