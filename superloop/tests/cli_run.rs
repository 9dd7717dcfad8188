//! CLI tests for `superloop` subcommands.
//!
//! Spawns the superloop binary against temp repositories and checks exit
//! codes and printed output. Role commands are small `sh` scripts.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use superloop::exit_codes;

fn superloop(repo: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_superloop"))
        .args(args)
        .arg("--repo")
        .arg(repo)
        .output()
        .expect("spawn superloop")
}

fn write_config(repo: &Path, role_script: &str) {
    let config = format!(
        r#"[runner]
command = ["sh", "-c", "{role_script}"]
forward_output = false
max_timeout_secs = 30
inactivity_timeout_secs = 30
kill_grace_secs = 1

[[loops]]
id = "main"
max_iterations = 3
completion_promise = "DONE"

[[loops.roles]]
name = "implementer"
prompt = ".superloop/roles/implementer.md"
"#
    );
    fs::create_dir_all(repo.join(".superloop/roles")).expect("mkdir");
    fs::write(repo.join(".superloop/config.toml"), config).expect("config");
    fs::write(repo.join(".superloop/roles/implementer.md"), "# Implementer\n").expect("prompt");
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn init_then_status_reports_an_idle_repo() {
    let temp = tempfile::tempdir().expect("tempdir");

    let init = superloop(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    assert!(temp.path().join(".superloop/config.toml").exists());

    let again = superloop(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));

    let status = superloop(temp.path(), &["status"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    let out = stdout(&status);
    assert!(out.starts_with("state: idle"), "{out}");
    assert!(out.contains("[main]"), "{out}");
}

#[test]
fn run_without_config_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = superloop(temp.path(), &["run"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let err = String::from_utf8_lossy(&output.stderr);
    assert!(err.starts_with("error: invalid config:"), "{err}");
    assert!(err.contains("superloop init"), "{err}");
}

#[cfg(unix)]
#[test]
fn run_completes_when_the_role_makes_the_promise() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(temp.path(), "cat > /dev/null; echo working; echo '<promise>DONE</promise>'");

    let output = superloop(temp.path(), &["run"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");
    assert!(stdout(&output).contains("all loops complete"));

    let status = stdout(&superloop(temp.path(), &["status"]));
    assert!(status.contains("last: iteration 1 complete"), "{status}");

    let dry = superloop(temp.path(), &["run", "--dry-run"]);
    assert_eq!(dry.status.code(), Some(exit_codes::OK));
    assert!(stdout(&dry).starts_with("[main] would complete"), "{}", stdout(&dry));
}

#[cfg(unix)]
#[test]
fn failing_role_exits_with_role_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(temp.path(), "cat > /dev/null; echo boom >&2; exit 3");

    let output = superloop(temp.path(), &["run"]);
    assert_eq!(output.status.code(), Some(exit_codes::ROLE_FAILED));
    let err = String::from_utf8_lossy(&output.stderr);
    assert!(err.contains("role 'implementer' failed with exit code 3"), "{err}");

    let logs: Vec<_> = glob::glob(
        &temp
            .path()
            .join(".superloop/loops/main/runs/*/iter-1/implementer.log")
            .display()
            .to_string(),
    )
    .expect("glob")
    .filter_map(Result::ok)
    .collect();
    assert_eq!(logs.len(), 1);
    assert_eq!(fs::read_to_string(&logs[0]).expect("log"), "boom\n");
}

#[test]
fn approve_without_a_pending_request_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(temp.path(), "true");
    let output = superloop(temp.path(), &["approve", "--loop", "main"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let err = String::from_utf8_lossy(&output.stderr);
    assert!(err.contains("no approval request"), "{err}");
}
