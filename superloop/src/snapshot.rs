//! Dry run: recompute the gate snapshot from artifacts already on disk.
//!
//! Nothing is spawned and nothing is written. The checklist is rescanned;
//! every other gate is read back from its status file.

use std::path::Path;

use anyhow::Result;
use chrono::Utc;

use crate::core::completion::{Verdict, verdict};
use crate::core::types::{GateOutcomes, GateResult, PromiseOutcome};
use crate::gates::synopsis;
use crate::io::approval::load_approval;
use crate::io::atomic::read_json_opt;
use crate::io::checklist::scan;
use crate::io::config::{LoopConfig, SuperloopConfig, TestMode};
use crate::io::evidence::EvidenceManifest;
use crate::io::paths::{LoopPaths, SuperloopPaths};
use crate::io::run_summary::load_run_summary;
use crate::io::test_gate::TestStatus;
use crate::io::validation::ValidationStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSnapshot {
    pub loop_id: String,
    /// Iteration of the last recorded entry; 0 before the first one.
    pub iteration: u32,
    pub promise: PromiseOutcome,
    pub gates: GateOutcomes,
    pub verdict: Verdict,
}

pub fn snapshot_all(repo: &Path, config: &SuperloopConfig) -> Result<Vec<GateSnapshot>> {
    let paths = SuperloopPaths::new(repo);
    config
        .loops
        .iter()
        .map(|lp| snapshot_loop(repo, lp, &paths.loop_paths(&lp.id)))
        .collect()
}

pub fn snapshot_loop(repo: &Path, loop_cfg: &LoopConfig, paths: &LoopPaths) -> Result<GateSnapshot> {
    let last = load_run_summary(&paths.run_summary)?.and_then(|s| s.entries.into_iter().last());
    let (iteration, promise) = match last {
        Some(entry) => (entry.iteration, entry.promise),
        None => (
            0,
            PromiseOutcome {
                expected: loop_cfg.completion_promise.clone(),
                text: None,
                matched: false,
            },
        ),
    };

    let checklist = if loop_cfg.checklist.patterns.is_empty() {
        GateResult::disabled()
    } else {
        let status = scan(repo, &loop_cfg.checklist, Utc::now())?;
        if status.ok {
            GateResult::passed()
        } else {
            GateResult::failed(format!("{} item(s) remaining", status.remaining))
        }
    };

    let tests = if loop_cfg.tests.mode == TestMode::Disabled {
        GateResult::disabled()
    } else {
        match read_json_opt::<TestStatus>(&paths.test_status)? {
            Some(status) => GateResult {
                status: status.status,
                ok: status.ok,
                detail: Some(format!("from iteration {}", status.iteration)),
            },
            None => GateResult::skipped("no test results yet"),
        }
    };

    let validation = if !loop_cfg.validation.enabled {
        GateResult::disabled()
    } else {
        match read_json_opt::<ValidationStatus>(&paths.validation_status)? {
            Some(status) if status.ok => GateResult::passed(),
            Some(status) => {
                let failed = status.checks.iter().filter(|c| !c.ok).count();
                GateResult::failed(format!("{failed} check(s) failed"))
            }
            None => GateResult::skipped("no validation results yet"),
        }
    };

    let evidence = if !loop_cfg.evidence.enabled {
        GateResult::disabled()
    } else {
        match read_json_opt::<EvidenceManifest>(&paths.evidence)? {
            Some(manifest) if loop_cfg.evidence.required && !manifest.missing.is_empty() => {
                GateResult::failed(format!("missing: {}", manifest.missing.join(", ")))
            }
            Some(_) => GateResult::passed(),
            None => GateResult::skipped("no evidence manifest yet"),
        }
    };

    let approval = if !loop_cfg.approval.required {
        GateResult::disabled()
    } else {
        match load_approval(&paths.approval)? {
            Some(request) => request.status.gate_result(),
            None => GateResult::skipped("no approval request"),
        }
    };

    let gates = GateOutcomes {
        checklist,
        tests,
        validation,
        evidence,
        approval,
    };
    let verdict = verdict(&promise, &gates, &loop_cfg.gate_policy());
    Ok(GateSnapshot {
        loop_id: loop_cfg.id.clone(),
        iteration,
        promise,
        gates,
        verdict,
    })
}

pub fn render_snapshots(snapshots: &[GateSnapshot]) -> String {
    let mut out = String::new();
    for snap in snapshots {
        let outlook = match snap.verdict {
            Verdict::Complete => "would complete",
            Verdict::AwaitApproval => "would await approval",
            Verdict::Continue => "would continue",
        };
        out.push_str(&format!("[{}] {}\n", snap.loop_id, outlook));
        out.push_str(&format!(
            "  {}\n",
            synopsis(snap.iteration, &snap.promise, &snap.gates)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;
    use crate::core::types::GateStatus;
    use crate::io::atomic::write_json_atomic;
    use crate::io::run_summary::{IterationDecision, IterationRecord, append_entry};
    use crate::test_support::loop_config;

    fn now() -> chrono::DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    fn record(iteration: u32, matched: bool) -> IterationRecord {
        IterationRecord {
            run_id: "run-1".to_string(),
            iteration,
            started_at: now(),
            ended_at: now(),
            promise: PromiseOutcome {
                expected: "DONE".to_string(),
                text: matched.then(|| "DONE".to_string()),
                matched,
            },
            gates: GateOutcomes::default(),
            stuck: None,
            completion_ok: false,
            decision: IterationDecision::Continue,
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn empty_loop_would_continue_and_nothing_is_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lp = loop_config("main");
        let paths = SuperloopPaths::new(temp.path()).loop_paths("main");

        let snap = snapshot_loop(temp.path(), &lp, &paths).expect("snapshot");
        assert_eq!(snap.iteration, 0);
        assert_eq!(snap.verdict, Verdict::Continue);
        assert!(!paths.dir.exists());
    }

    #[test]
    fn status_files_feed_the_verdict() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut lp = loop_config("main");
        lp.tests.mode = TestMode::OnPromise;
        lp.tests.commands = vec!["true".to_string()];
        lp.checklist.patterns = vec!["PLAN.md".to_string()];
        fs::write(temp.path().join("PLAN.md"), "- [x] done\n").expect("plan");
        let paths = SuperloopPaths::new(temp.path()).loop_paths("main");
        append_entry(&paths, "main", record(4, true), now()).expect("entry");
        write_json_atomic(
            &paths.test_status,
            &TestStatus {
                status: GateStatus::Ok,
                ok: true,
                iteration: 4,
                commands: Vec::new(),
                checked_at: now(),
            },
        )
        .expect("test status");

        let snap = snapshot_loop(temp.path(), &lp, &paths).expect("snapshot");
        assert_eq!(snap.iteration, 4);
        assert_eq!(snap.gates.checklist.status, GateStatus::Ok);
        assert!(snap.gates.tests.ok);
        assert_eq!(snap.verdict, Verdict::Complete);

        fs::write(temp.path().join("PLAN.md"), "- [ ] not yet\n").expect("plan");
        let snap = snapshot_loop(temp.path(), &lp, &paths).expect("snapshot");
        assert_eq!(snap.verdict, Verdict::Continue);
        let rendered = render_snapshots(&[snap]);
        assert!(rendered.starts_with("[main] would continue\n"));
        assert!(rendered.contains("checklist=failed(1 item(s) remaining)"));
    }

    #[test]
    fn missing_test_status_is_skipped_not_passing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut lp = loop_config("main");
        lp.tests.mode = TestMode::Every;
        lp.tests.commands = vec!["true".to_string()];
        let paths = SuperloopPaths::new(temp.path()).loop_paths("main");
        append_entry(&paths, "main", record(1, true), now()).expect("entry");

        let snap = snapshot_loop(temp.path(), &lp, &paths).expect("snapshot");
        assert_eq!(snap.gates.tests.status, GateStatus::Skipped);
        assert_eq!(snap.verdict, Verdict::Continue);
    }
}
