//! Supervisor tests against real `sh` processes.
//!
//! Each test spawns a short shell script under `supervise` and checks how the
//! exit is classified and what lands in the role log.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::DateTime;
use superloop::core::types::{RoleExit, TimeoutKind};
use superloop::io::process::{SuperviseRequest, supervise};

fn request(dir: &Path, script: &str, max: Duration, inactivity: Duration) -> SuperviseRequest {
    SuperviseRequest {
        argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        workdir: dir.to_path_buf(),
        stdin: None,
        log_path: dir.join("runs/iter-1/implementer.log"),
        max_timeout: max,
        inactivity_timeout: inactivity,
        kill_grace: Duration::from_millis(200),
        forward_output: false,
    }
}

#[test]
fn silent_process_is_killed_for_inactivity() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(
        temp.path(),
        "echo starting; sleep 30",
        Duration::from_secs(20),
        Duration::from_millis(500),
    );

    let outcome = supervise(&req).expect("supervise");

    assert_eq!(outcome.exit, RoleExit::TimedOut(TimeoutKind::Inactivity));
    assert!(outcome.elapsed < Duration::from_secs(10));
    let log = fs::read_to_string(&req.log_path).expect("log");
    assert!(log.starts_with("starting\n"));
    assert!(log.contains("[superloop] process terminated: inactivity timeout"));
    assert!(log.contains("output truncated"));
}

#[test]
fn chatty_process_still_hits_the_hard_ceiling() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(
        temp.path(),
        "while true; do echo tick; sleep 0.1; done",
        Duration::from_secs(1),
        Duration::from_secs(20),
    );

    let outcome = supervise(&req).expect("supervise");

    assert_eq!(outcome.exit, RoleExit::TimedOut(TimeoutKind::HardCeiling));
    assert!(outcome.lines > 1);
    let log = fs::read_to_string(&req.log_path).expect("log");
    assert!(log.contains("tick\n"));
    assert!(log.contains("hard_ceiling timeout after 1s"));
}

#[test]
fn output_keeps_the_inactivity_timer_alive() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(
        temp.path(),
        "for i in 1 2 3 4 5 6; do echo $i; sleep 0.2; done",
        Duration::from_secs(20),
        Duration::from_millis(800),
    );

    let outcome = supervise(&req).expect("supervise");

    assert_eq!(outcome.exit, RoleExit::Success);
    assert_eq!(outcome.lines, 6);
    assert!(outcome.tail.ends_with('6'));
}

#[test]
fn non_zero_exit_with_marker_is_rate_limited() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(
        temp.path(),
        "echo 'Claude AI usage limit reached|1700003600' >&2; exit 1",
        Duration::from_secs(20),
        Duration::from_secs(20),
    );

    let outcome = supervise(&req).expect("supervise");

    match outcome.exit {
        RoleExit::RateLimited(info) => {
            assert_eq!(info.reset_at, DateTime::from_timestamp(1_700_003_600, 0));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[test]
fn zero_exit_ignores_a_rate_limit_marker() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(
        temp.path(),
        "echo 'Claude AI usage limit reached|1700003600'; exit 0",
        Duration::from_secs(20),
        Duration::from_secs(20),
    );

    assert_eq!(supervise(&req).expect("supervise").exit, RoleExit::Success);
}

#[test]
fn exit_code_and_stdin_prompt_pass_through() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut req = request(
        temp.path(),
        "cat; exit 7",
        Duration::from_secs(20),
        Duration::from_secs(20),
    );
    req.stdin = Some(b"the prompt\n".to_vec());

    let outcome = supervise(&req).expect("supervise");

    assert_eq!(outcome.exit, RoleExit::Failed(7));
    let log = fs::read_to_string(&req.log_path).expect("log");
    assert_eq!(log, "the prompt\n");
}

#[test]
fn closed_output_still_hits_the_hard_ceiling() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(
        temp.path(),
        "echo hi; exec >/dev/null 2>&1; sleep 8",
        Duration::from_secs(1),
        Duration::from_secs(20),
    );

    let outcome = supervise(&req).expect("supervise");

    assert_eq!(outcome.exit, RoleExit::TimedOut(TimeoutKind::HardCeiling));
    assert!(outcome.elapsed < Duration::from_secs(5), "{:?}", outcome.elapsed);
    let log = fs::read_to_string(&req.log_path).expect("log");
    assert!(log.starts_with("hi\n"));
    assert!(log.contains("hard_ceiling timeout after 1s"));
}

#[test]
fn closed_output_still_hits_the_inactivity_deadline() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(
        temp.path(),
        "exec >/dev/null 2>&1; sleep 8",
        Duration::from_secs(20),
        Duration::from_millis(500),
    );

    let outcome = supervise(&req).expect("supervise");

    assert_eq!(outcome.exit, RoleExit::TimedOut(TimeoutKind::Inactivity));
    assert!(outcome.elapsed < Duration::from_secs(5), "{:?}", outcome.elapsed);
}

#[test]
fn closed_output_then_exit_reports_the_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(
        temp.path(),
        "echo hi; exec >/dev/null 2>&1; sleep 0.3; exit 4",
        Duration::from_secs(20),
        Duration::from_secs(20),
    );

    assert_eq!(supervise(&req).expect("supervise").exit, RoleExit::Failed(4));
}

#[test]
fn descendant_holding_output_does_not_outlive_the_role() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(
        temp.path(),
        "sleep 5 & echo done; exit 0",
        Duration::from_secs(20),
        Duration::from_secs(2),
    );

    let outcome = supervise(&req).expect("supervise");

    assert_eq!(outcome.exit, RoleExit::Success);
    assert!(outcome.elapsed < Duration::from_secs(2), "{:?}", outcome.elapsed);
    assert_eq!(outcome.lines, 1);
    assert_eq!(outcome.tail, "done");
}

#[test]
fn unbounded_limits_do_not_overflow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let req = request(temp.path(), "echo ok", Duration::MAX, Duration::MAX);

    let outcome = supervise(&req).expect("supervise");

    assert_eq!(outcome.exit, RoleExit::Success);
    assert_eq!(outcome.tail, "ok");
}

#[test]
fn forwarded_output_still_reaches_the_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut req = request(
        temp.path(),
        "echo one; echo two >&2",
        Duration::from_secs(20),
        Duration::from_secs(20),
    );
    req.forward_output = true;

    let outcome = supervise(&req).expect("supervise");

    assert_eq!(outcome.exit, RoleExit::Success);
    assert_eq!(outcome.lines, 2);
    let log = fs::read_to_string(&req.log_path).expect("log");
    assert!(log.contains("one\n") && log.contains("two\n"));
}
