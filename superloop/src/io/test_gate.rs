//! Test gate: configured test commands run in the repository root.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::completion::tests_due_on_promise;
use crate::core::types::{GateResult, GateStatus};
use crate::io::atomic::{remove_if_exists, write_atomic, write_json_atomic};
use crate::io::config::{TestMode, TestsConfig};
use crate::io::paths::LoopPaths;
use crate::io::process::{CommandSpec, run_with_timeout};

#[derive(Debug, Clone)]
pub struct TestRequest {
    pub repo: PathBuf,
    pub commands: Vec<String>,
    /// Timeout per command.
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCommandResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub ok: bool,
    pub commands: Vec<TestCommandResult>,
    /// Combined output of every command that ran.
    pub output: String,
}

pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestReport>;
}

/// Runs each command through `sh -c`, stopping at the first failure.
pub struct ShellTestRunner;

impl TestRunner for ShellTestRunner {
    #[instrument(skip_all, fields(commands = request.commands.len()))]
    fn run(&self, request: &TestRequest) -> Result<TestReport> {
        let mut commands = Vec::new();
        let mut output = String::new();
        let mut ok = true;

        for command in &request.commands {
            info!(command = %command, "running test command");
            let started = Instant::now();
            let spec = CommandSpec::new(command, &request.repo, request.timeout);
            let result = run_with_timeout(&spec, request.output_limit_bytes)?;

            output.push_str(&format!("$ {command}\n"));
            output.push_str(&result.combined("test"));
            if !output.ends_with('\n') {
                output.push('\n');
            }
            commands.push(TestCommandResult {
                command: command.clone(),
                exit_code: result.exit_code,
                timed_out: result.timed_out,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            });
            if !result.success() {
                warn!(command = %command, exit_code = ?result.exit_code, timed_out = result.timed_out, "test command failed");
                ok = false;
                break;
            }
        }

        Ok(TestReport {
            ok,
            commands,
            output,
        })
    }
}

/// `test-status.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStatus {
    pub status: GateStatus,
    pub ok: bool,
    pub iteration: u32,
    pub commands: Vec<TestCommandResult>,
    pub checked_at: DateTime<Utc>,
}

pub struct TestGateRequest<'a> {
    pub config: &'a TestsConfig,
    pub repo: PathBuf,
    pub output_limit_bytes: usize,
    pub promise_matched: bool,
    pub checklist_ok: bool,
    pub paths: &'a LoopPaths,
    pub iteration: u32,
    pub now: DateTime<Utc>,
}

/// Run tests when the mode says they are due and record the outcome.
pub fn evaluate_tests<R: TestRunner + ?Sized>(
    runner: &R,
    request: &TestGateRequest<'_>,
) -> Result<GateResult> {
    // `test-output.txt` only ever holds output from this iteration.
    remove_if_exists(&request.paths.test_output)?;

    let due = match request.config.mode {
        TestMode::Disabled => return Ok(GateResult::disabled()),
        TestMode::Every => true,
        TestMode::OnPromise => tests_due_on_promise(request.promise_matched, request.checklist_ok),
    };

    if !due {
        debug!("tests not due this iteration");
        let result = GateResult::skipped("on_promise: promise not matched and checklist open");
        write_json_atomic(
            &request.paths.test_status,
            &TestStatus {
                status: result.status,
                ok: result.ok,
                iteration: request.iteration,
                commands: Vec::new(),
                checked_at: request.now,
            },
        )?;
        return Ok(result);
    }

    let report = runner.run(&TestRequest {
        repo: request.repo.clone(),
        commands: request.config.commands.clone(),
        timeout: Duration::from_secs(request.config.timeout_secs),
        output_limit_bytes: request.output_limit_bytes,
    })?;

    write_atomic(&request.paths.test_output, report.output.as_bytes())?;
    let result = if report.ok {
        GateResult::passed()
    } else {
        let failed = report
            .commands
            .last()
            .map(|c| c.command.clone())
            .unwrap_or_default();
        GateResult::failed(format!("`{failed}` failed"))
    };
    write_json_atomic(
        &request.paths.test_status,
        &TestStatus {
            status: result.status,
            ok: result.ok,
            iteration: request.iteration,
            commands: report.commands,
            checked_at: request.now,
        },
    )?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct FakeTestRunner {
        ok: bool,
        calls: Cell<u32>,
    }

    impl TestRunner for FakeTestRunner {
        fn run(&self, request: &TestRequest) -> Result<TestReport> {
            self.calls.set(self.calls.get() + 1);
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
                output: if self.ok { "ok\n" } else { "error: boom\n" }.to_string(),
            })
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    fn config(mode: TestMode) -> TestsConfig {
        TestsConfig {
            mode,
            commands: vec!["cargo test".to_string()],
            timeout_secs: 60,
        }
    }

    fn run(mode: TestMode, promise: bool, checklist: bool, runner: &FakeTestRunner, paths: &LoopPaths) -> GateResult {
        let cfg = config(mode);
        evaluate_tests(
            runner,
            &TestGateRequest {
                config: &cfg,
                repo: PathBuf::from("."),
                output_limit_bytes: 1024,
                promise_matched: promise,
                checklist_ok: checklist,
                paths,
                iteration: 1,
                now: now(),
            },
        )
        .expect("evaluate")
    }

    #[test]
    fn on_promise_skips_until_promise_or_checklist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = LoopPaths::new(temp.path());
        let runner = FakeTestRunner {
            ok: true,
            calls: Cell::new(0),
        };

        let skipped = run(TestMode::OnPromise, false, false, &runner, &paths);
        assert_eq!(skipped.status, GateStatus::Skipped);
        assert!(!skipped.ok);
        assert_eq!(runner.calls.get(), 0);

        assert!(run(TestMode::OnPromise, true, false, &runner, &paths).ok);
        assert!(run(TestMode::OnPromise, false, true, &runner, &paths).ok);
        assert_eq!(runner.calls.get(), 2);
    }

    #[test]
    fn failing_tests_write_output_and_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = LoopPaths::new(temp.path());
        let runner = FakeTestRunner {
            ok: false,
            calls: Cell::new(0),
        };
        let result = run(TestMode::Every, false, false, &runner, &paths);
        assert_eq!(result.status, GateStatus::Failed);

        let output = std::fs::read_to_string(&paths.test_output).expect("output");
        assert_eq!(output, "error: boom\n");
        let status: TestStatus = crate::io::atomic::read_json(&paths.test_status).expect("status");
        assert!(!status.ok);
        assert_eq!(status.commands.len(), 1);
    }

    #[test]
    fn skipped_run_clears_previous_failure_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = LoopPaths::new(temp.path());
        let runner = FakeTestRunner {
            ok: false,
            calls: Cell::new(0),
        };

        run(TestMode::OnPromise, true, false, &runner, &paths);
        assert!(paths.test_output.exists());

        let skipped = run(TestMode::OnPromise, false, false, &runner, &paths);
        assert_eq!(skipped.status, GateStatus::Skipped);
        assert!(!paths.test_output.exists());
        assert_eq!(runner.calls.get(), 1);
    }

    #[test]
    fn disabled_tests_pass_vacuously() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = LoopPaths::new(temp.path());
        let runner = FakeTestRunner {
            ok: false,
            calls: Cell::new(0),
        };
        let result = run(TestMode::Disabled, false, false, &runner, &paths);
        assert_eq!(result, GateResult::disabled());
        assert!(!paths.test_status.exists());
    }

    #[cfg(unix)]
    #[test]
    fn shell_runner_stops_at_first_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = ShellTestRunner
            .run(&TestRequest {
                repo: temp.path().to_path_buf(),
                commands: vec!["echo one".to_string(), "exit 4".to_string(), "echo three".to_string()],
                timeout: Duration::from_secs(10),
                output_limit_bytes: 1024,
            })
            .expect("run");
        assert!(!report.ok);
        assert_eq!(report.commands.len(), 2);
        assert_eq!(report.commands[1].exit_code, Some(4));
        assert!(report.output.contains("$ echo one\none\n"));
        assert!(!report.output.contains("three"));
    }
}
