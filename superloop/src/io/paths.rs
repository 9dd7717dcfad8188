//! On-disk layout under `.superloop/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

pub const SUPERLOOP_DIR: &str = ".superloop";

/// Repository-level paths.
#[derive(Debug, Clone)]
pub struct SuperloopPaths {
    pub repo: PathBuf,
    pub root: PathBuf,
    pub config: PathBuf,
    pub state: PathBuf,
    pub loops_dir: PathBuf,
    pub roles_dir: PathBuf,
}

impl SuperloopPaths {
    pub fn new(repo: &Path) -> Self {
        let root = repo.join(SUPERLOOP_DIR);
        Self {
            repo: repo.to_path_buf(),
            config: root.join("config.toml"),
            state: root.join("state.json"),
            loops_dir: root.join("loops"),
            roles_dir: root.join("roles"),
            root,
        }
    }

    pub fn loop_paths(&self, loop_id: &str) -> LoopPaths {
        LoopPaths::new(&self.loops_dir.join(loop_id))
    }
}

/// Per-loop artifact paths (`.superloop/loops/<id>/`).
#[derive(Debug, Clone)]
pub struct LoopPaths {
    pub dir: PathBuf,
    pub events: PathBuf,
    pub run_summary: PathBuf,
    pub timeline: PathBuf,
    pub gate_summary: PathBuf,
    pub checklist_status: PathBuf,
    pub checklist_remaining: PathBuf,
    pub test_status: PathBuf,
    pub test_output: PathBuf,
    pub validation_status: PathBuf,
    pub validation_dir: PathBuf,
    pub evidence: PathBuf,
    pub stuck: PathBuf,
    pub stuck_report: PathBuf,
    pub approval: PathBuf,
    pub rate_limit: PathBuf,
    pub recovery_proposal: PathBuf,
    pub recovery_state: PathBuf,
    pub recovery_escalation: PathBuf,
    pub runs_dir: PathBuf,
}

impl LoopPaths {
    pub fn new(dir: &Path) -> Self {
        let recovery = dir.join("recovery");
        Self {
            dir: dir.to_path_buf(),
            events: dir.join("events.jsonl"),
            run_summary: dir.join("run-summary.json"),
            timeline: dir.join("timeline.md"),
            gate_summary: dir.join("gate-summary.txt"),
            checklist_status: dir.join("checklist-status.json"),
            checklist_remaining: dir.join("checklist-remaining.md"),
            test_status: dir.join("test-status.json"),
            test_output: dir.join("test-output.txt"),
            validation_status: dir.join("validation-status.json"),
            validation_dir: dir.join("validation"),
            evidence: dir.join("evidence.json"),
            stuck: dir.join("stuck.json"),
            stuck_report: dir.join("stuck-report.md"),
            approval: dir.join("approval.json"),
            rate_limit: dir.join("rate-limit.json"),
            recovery_proposal: recovery.join("proposal.json"),
            recovery_state: recovery.join("state.json"),
            recovery_escalation: recovery.join("escalation.json"),
            runs_dir: dir.join("runs"),
        }
    }

    /// `runs/<run_id>/iter-<n>/`
    pub fn iteration_dir(&self, run_id: &str, iteration: u32) -> PathBuf {
        self.runs_dir.join(run_id).join(format!("iter-{iteration}"))
    }
}

/// Expand a repo-relative glob to existing files.
pub fn expand_glob(repo: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&repo.to_string_lossy()),
        pattern.trim_start_matches("./")
    );
    let mut out = Vec::new();
    for entry in glob::glob(&full).with_context(|| format!("invalid glob '{pattern}'"))? {
        match entry {
            Ok(path) if path.is_file() => out.push(path),
            Ok(_) => {}
            Err(err) => warn!(err = %err, "unreadable glob match"),
        }
    }
    out.sort();
    Ok(out)
}
