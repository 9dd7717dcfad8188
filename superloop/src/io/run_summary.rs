//! Run summary (`run-summary.json`) and its derived timeline (`timeline.md`).

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{GateOutcomes, PromiseOutcome};
use crate::io::atomic::{read_json_opt, write_atomic, write_json_atomic};
use crate::io::evidence::ArtifactMeta;
use crate::io::paths::LoopPaths;
use crate::io::report::render_timeline;

pub const RUN_SUMMARY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub version: u32,
    pub loop_id: String,
    pub updated_at: DateTime<Utc>,
    pub entries: Vec<IterationRecord>,
}

impl RunSummary {
    pub fn new(loop_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            version: RUN_SUMMARY_VERSION,
            loop_id: loop_id.into(),
            updated_at: now,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckSnapshot {
    pub streak: u32,
    pub threshold: u32,
}

/// How an iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationDecision {
    Continue,
    AwaitApproval,
    Complete,
    Stuck,
    Approved,
    Rejected,
}

impl IterationDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationDecision::Continue => "continue",
            IterationDecision::AwaitApproval => "await_approval",
            IterationDecision::Complete => "complete",
            IterationDecision::Stuck => "stuck",
            IterationDecision::Approved => "approved",
            IterationDecision::Rejected => "rejected",
        }
    }
}

/// One finalized iteration. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub run_id: String,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub promise: PromiseOutcome,
    pub gates: GateOutcomes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck: Option<StuckSnapshot>,
    pub completion_ok: bool,
    pub decision: IterationDecision,
    pub artifacts: Vec<ArtifactMeta>,
}

pub fn load_run_summary(path: &Path) -> Result<Option<RunSummary>> {
    read_json_opt(path).with_context(|| format!("load run summary {}", path.display()))
}

/// Append an entry, then regenerate the timeline in full.
pub fn append_entry(
    paths: &LoopPaths,
    loop_id: &str,
    entry: IterationRecord,
    now: DateTime<Utc>,
) -> Result<RunSummary> {
    let mut summary =
        load_run_summary(&paths.run_summary)?.unwrap_or_else(|| RunSummary::new(loop_id, now));
    debug!(
        iteration = entry.iteration,
        decision = entry.decision.as_str(),
        entries = summary.entries.len(),
        "appending run summary entry"
    );
    summary.entries.push(entry);
    summary.updated_at = now;
    write_json_atomic(&paths.run_summary, &summary)?;

    let timeline = render_timeline(&summary).context("render timeline")?;
    write_atomic(&paths.timeline, timeline.as_bytes())?;
    Ok(summary)
}
