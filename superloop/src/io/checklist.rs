//! Checklist gate: outstanding `- [ ]` items across configured files.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::checklist::scan_unchecked;
use crate::core::types::GateResult;
use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::config::ChecklistConfig;
use crate::io::paths::{LoopPaths, expand_glob};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// `checklist-status.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistStatus {
    pub ok: bool,
    pub remaining: usize,
    pub items: Vec<ChecklistItem>,
    /// Patterns that matched no file; each counts as one outstanding item.
    pub unmatched_patterns: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl ChecklistStatus {
    /// One line per outstanding item, for reports.
    pub fn describe_items(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| format!("{}:{} {}", item.path, item.line, item.text))
            .chain(
                self.unmatched_patterns
                    .iter()
                    .map(|pattern| format!("{pattern}: no matching file")),
            )
            .collect()
    }
}

/// Scan configured files without writing anything.
pub fn scan(repo: &Path, config: &ChecklistConfig, now: DateTime<Utc>) -> Result<ChecklistStatus> {
    let mut items = Vec::new();
    let mut unmatched_patterns = Vec::new();
    let mut seen = Vec::new();

    for pattern in &config.patterns {
        let files = expand_glob(repo, pattern)?;
        if files.is_empty() {
            unmatched_patterns.push(pattern.clone());
            continue;
        }
        for file in files {
            if seen.contains(&file) {
                continue;
            }
            let contents = fs::read_to_string(&file)
                .with_context(|| format!("read checklist {}", file.display()))?;
            let rel = file
                .strip_prefix(repo)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");
            items.extend(scan_unchecked(&contents).into_iter().map(|item| ChecklistItem {
                path: rel.clone(),
                line: item.line,
                text: item.text,
            }));
            seen.push(file);
        }
    }

    let remaining = items.len() + unmatched_patterns.len();
    Ok(ChecklistStatus {
        ok: remaining == 0,
        remaining,
        items,
        unmatched_patterns,
        checked_at: now,
    })
}

/// Evaluate the gate and write `checklist-status.json` and `checklist-remaining.md`.
#[instrument(skip_all, fields(patterns = config.patterns.len()))]
pub fn evaluate_checklist(
    repo: &Path,
    config: &ChecklistConfig,
    paths: &LoopPaths,
    now: DateTime<Utc>,
) -> Result<(GateResult, ChecklistStatus)> {
    let status = scan(repo, config, now)?;
    write_json_atomic(&paths.checklist_status, &status)?;
    write_atomic(&paths.checklist_remaining, render_remaining(&status).as_bytes())?;
    debug!(remaining = status.remaining, "checklist scanned");

    let result = if config.patterns.is_empty() {
        GateResult::disabled()
    } else if status.ok {
        GateResult::passed()
    } else {
        GateResult::failed(format!("{} item(s) remaining", status.remaining))
    };
    Ok((result, status))
}

fn render_remaining(status: &ChecklistStatus) -> String {
    let mut out = String::from("# Remaining checklist items\n\n");
    if status.remaining == 0 {
        out.push_str("None.\n");
        return out;
    }
    for line in status.describe_items() {
        out.push_str("- ");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    #[test]
    fn fenced_items_are_ignored_and_real_items_counted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path();
        fs::write(
            repo.join("PLAN.md"),
            "- [x] done\n```\n- [ ] example inside fence\n```\n- [ ] real item\n",
        )
        .expect("write");
        let config = ChecklistConfig {
            patterns: vec!["PLAN.md".to_string()],
        };
        let paths = LoopPaths::new(&repo.join(".superloop/loops/main"));

        let (result, status) = evaluate_checklist(repo, &config, &paths, now()).expect("evaluate");
        assert!(!result.ok);
        assert_eq!(status.remaining, 1);
        assert_eq!(status.items[0].line, 5);
        assert_eq!(status.items[0].text, "real item");

        let remaining = fs::read_to_string(&paths.checklist_remaining).expect("remaining");
        assert!(remaining.contains("- PLAN.md:5 real item"));
    }

    #[test]
    fn unmatched_pattern_counts_as_one_item() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = ChecklistConfig {
            patterns: vec!["missing/*.md".to_string()],
        };
        let status = scan(temp.path(), &config, now()).expect("scan");
        assert!(!status.ok);
        assert_eq!(status.remaining, 1);
        assert_eq!(status.describe_items(), vec!["missing/*.md: no matching file"]);
    }

    #[test]
    fn all_checked_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("TODO.md"), "- [x] one\n* [X] two\n").expect("write");
        let config = ChecklistConfig {
            patterns: vec!["*.md".to_string()],
        };
        let paths = LoopPaths::new(&temp.path().join(".superloop/loops/main"));
        let (result, _) = evaluate_checklist(temp.path(), &config, &paths, now()).expect("evaluate");
        assert!(result.ok);
    }
}
