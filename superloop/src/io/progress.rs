//! Progress detector: working-tree and test-failure fingerprints.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::core::signature::{code_signature, failure_lines, sha256_hex, test_signature};
use crate::core::stuck::{StuckState, advance};
use crate::io::atomic::{read_json_opt, write_atomic, write_json_atomic};
use crate::io::config::StuckConfig;
use crate::io::git::Git;
use crate::io::paths::{LoopPaths, SUPERLOOP_DIR};
use crate::io::report::{StuckReportInput, render_stuck_report};

/// Placeholder hash for tracked files missing from the working tree.
const DELETED: &str = "<deleted>";

/// `(relative path, content hash)` for every tracked or untracked, non-ignored file.
pub fn working_tree_entries(repo: &Path, ignore: &[String]) -> Result<Vec<(String, String)>> {
    let patterns = ignore
        .iter()
        .map(|p| glob::Pattern::new(p).with_context(|| format!("invalid ignore glob '{p}'")))
        .collect::<Result<Vec<_>>>()?;
    let state_prefix = format!("{SUPERLOOP_DIR}/");

    let mut entries = Vec::new();
    for rel in Git::new(repo).list_files()? {
        if rel.starts_with(&state_prefix) || patterns.iter().any(|p| p.matches(&rel)) {
            continue;
        }
        let path = repo.join(&rel);
        let hash = if path.is_file() {
            let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            sha256_hex(&bytes)
        } else if path.exists() {
            // Submodules and other non-file entries.
            continue;
        } else {
            DELETED.to_string()
        };
        entries.push((rel, hash));
    }
    Ok(entries)
}

pub struct ProgressRequest<'a> {
    pub repo: &'a Path,
    pub config: &'a StuckConfig,
    pub paths: &'a LoopPaths,
    pub loop_id: &'a str,
    pub run_id: &'a str,
    pub iteration: u32,
    /// Outstanding checklist items, for the report.
    pub unchecked: &'a [String],
    pub now: DateTime<Utc>,
}

/// Advance the persisted streak and write a report when the threshold is reached.
#[instrument(skip_all, fields(iteration = request.iteration))]
pub fn check_progress(request: &ProgressRequest<'_>) -> Result<StuckState> {
    let code = match working_tree_entries(request.repo, &request.config.ignore) {
        Ok(entries) => code_signature(&entries),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "working tree fingerprint unavailable");
            String::new()
        }
    };
    let test_output = match fs::read_to_string(&request.paths.test_output) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read {}", request.paths.test_output.display()));
        }
    };
    let test = test_signature(&test_output);

    let prev: Option<StuckState> = read_json_opt(&request.paths.stuck)?;
    let state = advance(
        prev.as_ref(),
        request.run_id,
        code,
        test,
        request.config.threshold,
        request.now,
    );
    write_json_atomic(&request.paths.stuck, &state)?;
    debug!(streak = state.streak, reason = state.reason.as_str(), "progress checked");

    if state.is_stuck() {
        let report = render_stuck_report(&StuckReportInput {
            loop_id: request.loop_id,
            run_id: request.run_id,
            iteration: request.iteration,
            state: &state,
            failure_lines: &failure_lines(&test_output),
            unchecked: request.unchecked,
        })?;
        write_atomic(&request.paths.stuck_report, report.as_bytes())?;
        warn!(streak = state.streak, threshold = state.threshold, "loop is stuck");
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stuck::StuckReason;
    use crate::test_support::TestRepo;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    #[test]
    fn state_dir_and_ignored_globs_do_not_affect_signature() {
        let repo = TestRepo::new().expect("repo");
        repo.write("src/lib.rs", "fn a() {}\n").expect("write");
        let before = code_signature(&working_tree_entries(repo.root(), &["*.log".to_string()]).expect("entries"));

        repo.write(".superloop/loops/main/events.jsonl", "{}\n").expect("write");
        repo.write("build.log", "noise\n").expect("write");
        let after = code_signature(&working_tree_entries(repo.root(), &["*.log".to_string()]).expect("entries"));
        assert_eq!(before, after);

        repo.write("src/lib.rs", "fn b() {}\n").expect("write");
        let changed = code_signature(&working_tree_entries(repo.root(), &["*.log".to_string()]).expect("entries"));
        assert_ne!(before, changed);
    }

    #[test]
    fn deleted_tracked_file_changes_signature() {
        let repo = TestRepo::new().expect("repo");
        repo.write("a.txt", "a\n").expect("write");
        repo.commit_all("add a").expect("commit");
        let before = working_tree_entries(repo.root(), &[]).expect("entries");

        fs::remove_file(repo.root().join("a.txt")).expect("remove");
        let after = working_tree_entries(repo.root(), &[]).expect("entries");
        assert!(after.contains(&("a.txt".to_string(), DELETED.to_string())));
        assert_ne!(code_signature(&before), code_signature(&after));
    }

    #[test]
    fn report_is_written_when_threshold_reached() {
        let repo = TestRepo::new().expect("repo");
        repo.write("src/lib.rs", "fn a() {}\n").expect("write");
        let paths = LoopPaths::new(&repo.root().join(".superloop/loops/main"));
        let config = StuckConfig {
            enabled: true,
            threshold: 2,
            ignore: Vec::new(),
        };
        let request = |iteration| ProgressRequest {
            repo: repo.root(),
            config: &config,
            paths: &paths,
            loop_id: "main",
            run_id: "run-1",
            iteration,
            unchecked: &[],
            now: now(),
        };

        let first = check_progress(&request(1)).expect("check");
        assert_eq!(first.streak, 1);
        assert!(!paths.stuck_report.exists());

        let second = check_progress(&request(2)).expect("check");
        assert_eq!(second.reason, StuckReason::NoCodeChanges);
        assert!(second.is_stuck());
        assert!(paths.stuck_report.exists());
    }

    #[test]
    fn state_from_another_run_is_not_continued() {
        let repo = TestRepo::new().expect("repo");
        repo.write("src/lib.rs", "fn a() {}\n").expect("write");
        let paths = LoopPaths::new(&repo.root().join(".superloop/loops/main"));
        let config = StuckConfig {
            enabled: true,
            threshold: 2,
            ignore: Vec::new(),
        };
        let request = |run_id| ProgressRequest {
            repo: repo.root(),
            config: &config,
            paths: &paths,
            loop_id: "main",
            run_id,
            iteration: 1,
            unchecked: &[],
            now: now(),
        };

        assert_eq!(check_progress(&request("run-1")).expect("check").streak, 1);
        let next = check_progress(&request("run-2")).expect("check");
        assert_eq!(next.streak, 1);
        assert_eq!(next.run_id, "run-2");
        assert!(!next.is_stuck());
    }
}
