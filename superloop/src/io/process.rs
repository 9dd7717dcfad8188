//! Child process execution: bounded shell commands and supervised role processes.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::rate_limit::{self, RateLimitInfo};
use crate::core::types::{RoleExit, TimeoutKind};

/// Lines kept in memory for the last-message fallback.
const TAIL_LINES: usize = 200;
/// Lines buffered between reader threads and the supervisor loop.
const LINE_CHANNEL_BOUND: usize = 1024;
/// Liveness check interval while output is streaming.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long output is drained after the main process exits.
const EXIT_DRAIN: Duration = Duration::from_millis(300);
/// Longest wait ever scheduled; larger limits are clamped to it.
const MAX_WAIT: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// A shell command run through `sh -c` in a working directory.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            timeout,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code; `None` when the command timed out.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, with truncation notices.
    pub fn combined(&self, label: &str) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            out.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            out.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            out.push_str(&format!("\n[{label} timed out]\n"));
        }
        out
    }
}

/// Run a shell command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(command = %spec.command, timeout_secs = spec.timeout.as_secs()))]
pub fn run_with_timeout(spec: &CommandSpec, output_limit_bytes: usize) -> Result<CommandOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&spec.command)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    own_process_group(&mut cmd);

    debug!("spawning shell command");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn `{}`", spec.command));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(spec.timeout.min(MAX_WAIT)).context("wait for command")? {
        Some(status) => Some(status),
        None => {
            warn!(
                timeout_secs = spec.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            terminate(&mut child, Duration::from_secs(1))?;
            None
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let exit_code = status.as_ref().map(exit_code);
    debug!(?exit_code, timed_out, "command finished");
    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// One supervised role (or session) process.
#[derive(Debug, Clone)]
pub struct SuperviseRequest {
    /// Fully substituted argv; no shell layer.
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    /// Prompt bytes for stdin, or `None` to leave stdin unconnected.
    pub stdin: Option<Vec<u8>>,
    /// Combined stdout+stderr is appended here.
    pub log_path: PathBuf,
    pub max_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub kill_grace: Duration,
    pub forward_output: bool,
}

/// Result of a supervised process.
#[derive(Debug, Clone)]
pub struct SuperviseOutcome {
    pub exit: RoleExit,
    /// Last lines of combined output.
    pub tail: String,
    pub lines: usize,
    pub elapsed: Duration,
}

/// Run a process under dual deadlines while streaming its output.
///
/// The hard ceiling is measured from spawn; the inactivity deadline restarts on
/// every output line. On expiry the process group gets SIGTERM, then SIGKILL
/// after `kill_grace`. Every line is scanned for rate-limit markers; a marker
/// only classifies the exit when the process also exits non-zero.
#[instrument(skip_all, fields(program = %request.argv.first().map(String::as_str).unwrap_or(""), log = %request.log_path.display()))]
pub fn supervise(request: &SuperviseRequest) -> Result<SuperviseOutcome> {
    let (program, args) = request
        .argv
        .split_first()
        .ok_or_else(|| anyhow!("empty role command"))?;

    if let Some(parent) = request.log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let log = File::create(&request.log_path)
        .with_context(|| format!("create role log {}", request.log_path.display()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&request.workdir)
        .stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut cmd);

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn role command `{program}`"))?;
    debug!(pid = child.id(), "role process spawned");

    if let Some(input) = request.stdin.clone() {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A role that never reads stdin must not block the supervisor.
        thread::spawn(move || {
            if let Err(err) = child_stdin.write_all(&input)
                && err.kind() != std::io::ErrorKind::BrokenPipe
            {
                warn!(err = %err, "failed to write role stdin");
            }
        });
    }

    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(LINE_CHANNEL_BOUND);
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    spawn_line_reader(stdout, tx.clone());
    spawn_line_reader(stderr, tx);

    let mut sink = OutputSink {
        log,
        log_path: &request.log_path,
        forward: request.forward_output,
        tail: VecDeque::with_capacity(TAIL_LINES),
        lines: 0,
        rate_limited: None,
    };
    let hard_deadline = deadline(started, request.max_timeout);
    let mut last_activity = started;
    let mut streams_open = true;

    let ended: std::result::Result<ExitStatus, TimeoutKind> = loop {
        let now = Instant::now();
        if now >= hard_deadline {
            break Err(TimeoutKind::HardCeiling);
        }
        let idle_deadline = deadline(last_activity, request.inactivity_timeout);
        if now >= idle_deadline {
            break Err(TimeoutKind::Inactivity);
        }
        let wait = hard_deadline.min(idle_deadline) - now;

        if !streams_open {
            // Output is closed; the process itself is still bound by both deadlines.
            if let Some(exited) = child.wait_timeout(wait).context("wait for role process")? {
                break Ok(exited);
            }
            continue;
        }
        match rx.recv_timeout(wait.min(POLL_INTERVAL)) {
            Ok(line) => {
                last_activity = Instant::now();
                sink.record(&line)?;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                streams_open = false;
                continue;
            }
        }
        if let Some(exited) = child.try_wait().context("poll role process")? {
            sink.drain_after_exit(&rx)?;
            break Ok(exited);
        }
    };

    let exit = match ended {
        Err(kind) => {
            warn!(
                kind = kind.as_str(),
                elapsed_secs = started.elapsed().as_secs(),
                "role deadline expired, terminating"
            );
            terminate(&mut child, request.kill_grace)?;
            for line in rx.try_iter() {
                sink.log.write_all(&line).ok();
            }
            let limit = match kind {
                TimeoutKind::HardCeiling => request.max_timeout,
                TimeoutKind::Inactivity => request.inactivity_timeout,
            };
            writeln!(
                sink.log,
                "\n[superloop] process terminated: {} timeout after {}s; output truncated",
                kind.as_str(),
                limit.as_secs()
            )
            .with_context(|| format!("append role log {}", request.log_path.display()))?;
            RoleExit::TimedOut(kind)
        }
        Ok(status) => classify_exit(exit_code(&status), sink.rate_limited.take()),
    };
    sink.log.flush().ok();

    let lines = sink.lines;
    debug!(exit = exit.label(), code = exit.code(), lines, "role process finished");
    Ok(SuperviseOutcome {
        exit,
        tail: sink.tail.into_iter().collect::<Vec<_>>().join("\n"),
        lines,
        elapsed: started.elapsed(),
    })
}

/// `from + after`, clamped so oversized limits cannot overflow `Instant`.
fn deadline(from: Instant, after: Duration) -> Instant {
    from + after.min(MAX_WAIT)
}

/// Role output sink: log file, optional stdout echo, tail and rate-limit scan.
struct OutputSink<'a> {
    log: File,
    log_path: &'a Path,
    forward: bool,
    tail: VecDeque<String>,
    lines: usize,
    rate_limited: Option<RateLimitInfo>,
}

impl OutputSink<'_> {
    fn record(&mut self, line: &[u8]) -> Result<()> {
        self.lines += 1;
        self.log
            .write_all(line)
            .with_context(|| format!("append role log {}", self.log_path.display()))?;
        if self.forward {
            let mut out = std::io::stdout().lock();
            if let Err(err) = out.write_all(line).and_then(|()| out.flush()) {
                debug!(err = %err, "failed to forward role output");
            }
        }
        let text = String::from_utf8_lossy(line).trim_end().to_string();
        if self.rate_limited.is_none()
            && let Some(info) = rate_limit::detect(&text, Utc::now())
        {
            info!(line = %info.matched_line, "rate limit marker detected");
            self.rate_limited = Some(info);
        }
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(text);
        Ok(())
    }

    /// Collect output still in flight after the main process exited.
    ///
    /// A descendant may keep the pipes open; stop after `EXIT_DRAIN`.
    fn drain_after_exit(&mut self, rx: &Receiver<Vec<u8>>) -> Result<()> {
        let until = Instant::now() + EXIT_DRAIN;
        loop {
            let now = Instant::now();
            if now >= until {
                debug!("role exited while a descendant still holds its output");
                return Ok(());
            }
            match rx.recv_timeout(until - now) {
                Ok(line) => self.record(&line)?,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("role exited while a descendant still holds its output");
                    return Ok(());
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }
}

/// Exit status wins over a detected marker only when it is zero.
fn classify_exit(code: i32, rate_limited: Option<RateLimitInfo>) -> RoleExit {
    match (code, rate_limited) {
        (0, Some(info)) => {
            warn!(line = %info.matched_line, "rate limit marker seen but role exited 0");
            RoleExit::Success
        }
        (0, None) => RoleExit::Success,
        (_, Some(info)) => RoleExit::RateLimited(info),
        (code, None) => RoleExit::Failed(code),
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(reader: R, tx: mpsc::SyncSender<Vec<u8>>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if !line.ends_with(b"\n") {
                        line.push(b'\n');
                    }
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(err = %err, "role output reader stopped");
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// SIGTERM the child's process group, wait `grace`, then SIGKILL.
#[cfg(unix)]
fn terminate(child: &mut Child, grace: Duration) -> Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(i32::try_from(child.id()).context("child pid out of range")?);
    if let Err(err) = killpg(pgid, Signal::SIGTERM) {
        debug!(err = %err, "SIGTERM to process group failed");
    }
    if child
        .wait_timeout(grace)
        .context("wait after SIGTERM")?
        .is_none()
    {
        warn!(grace_secs = grace.as_secs(), "process ignored SIGTERM, sending SIGKILL");
        if let Err(err) = killpg(pgid, Signal::SIGKILL) {
            debug!(err = %err, "SIGKILL to process group failed");
        }
        child.wait().context("wait after SIGKILL")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _grace: Duration) -> Result<()> {
    child.kill().context("kill process")?;
    child.wait().context("wait after kill")?;
    Ok(())
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Path helper so callers can keep the log next to other iteration artifacts.
pub fn role_log_path(iteration_dir: &Path, role: &str) -> PathBuf {
    iteration_dir.join(format!("{role}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> RateLimitInfo {
        RateLimitInfo {
            reset_at: None,
            message: "429".to_string(),
            matched_line: "HTTP/1.1 429".to_string(),
        }
    }

    #[test]
    fn oversized_limits_are_clamped() {
        let now = Instant::now();
        assert_eq!(deadline(now, Duration::MAX), now + MAX_WAIT);
        assert_eq!(deadline(now, Duration::from_secs(5)), now + Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn shell_command_accepts_an_unbounded_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("echo ok", temp.path(), Duration::MAX);
        let output = run_with_timeout(&spec, 1024).expect("run");
        assert!(output.success());
        assert_eq!(output.stdout, b"ok\n");
    }

    #[test]
    fn zero_exit_beats_rate_limit_marker() {
        assert_eq!(classify_exit(0, Some(info())), RoleExit::Success);
    }

    #[test]
    fn non_zero_exit_with_marker_is_rate_limited() {
        assert!(matches!(
            classify_exit(1, Some(info())),
            RoleExit::RateLimited(_)
        ));
        assert_eq!(classify_exit(3, None), RoleExit::Failed(3));
    }

    #[cfg(unix)]
    #[test]
    fn shell_command_captures_output_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("echo out; echo err >&2; exit 3", temp.path(), Duration::from_secs(10));
        let output = run_with_timeout(&spec, 1024).expect("run");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        let combined = output.combined("test");
        assert!(combined.contains("out"));
        assert!(combined.contains("err"));
    }

    #[cfg(unix)]
    #[test]
    fn shell_command_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("sleep 5", temp.path(), Duration::from_millis(200));
        let output = run_with_timeout(&spec, 1024).expect("run");
        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
    }

    #[cfg(unix)]
    #[test]
    fn shell_command_sees_extra_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("printf %s \"$RESULT\"", temp.path(), Duration::from_secs(10))
            .with_env("RESULT", "hello");
        let output = run_with_timeout(&spec, 1024).expect("run");
        assert_eq!(output.stdout, b"hello");
    }
}
