//! Run state storage (`.superloop/state.json`).

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::atomic::{read_json_opt, write_json_atomic};

/// Sole authoritative record of where execution is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    /// True while a run is in progress (including clean pauses).
    pub active: bool,
    /// Index into the configured loop list.
    pub loop_index: usize,
    /// Current iteration (1-indexed, monotonically increasing within a run).
    pub iteration: u32,
    pub current_loop_id: Option<String>,
    /// Identifier for the current execution run; retired on completion.
    pub run_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            active: false,
            loop_index: 0,
            iteration: 1,
            current_loop_id: None,
            run_id: None,
            updated_at: None,
        }
    }
}

impl RunState {
    /// Current run id, minting one if the run has none yet.
    pub fn ensure_run_id(&mut self, now: DateTime<Utc>) -> String {
        if let Some(run_id) = &self.run_id {
            return run_id.clone();
        }
        let run_id = new_run_id(now);
        self.run_id = Some(run_id.clone());
        run_id
    }

    /// Move to the next loop: iteration back to 1, run id retired.
    pub fn complete_loop(&mut self, next_loop_id: Option<String>) {
        self.loop_index += 1;
        self.iteration = 1;
        self.run_id = None;
        self.active = next_loop_id.is_some();
        self.current_loop_id = next_loop_id;
    }
}

/// `run-YYYYmmddTHHMMSSZ-xxxxxx`
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("run-{}-{suffix:06x}", now.format("%Y%m%dT%H%M%SZ"))
}

/// Load run state from disk; a missing file is the default state.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let state = read_json_opt::<RunState>(path)
        .with_context(|| format!("load run state {}", path.display()))?
        .unwrap_or_default();
    debug!(run_id = ?state.run_id, loop_index = state.loop_index, iteration = state.iteration, "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename), stamping `updated_at`.
pub fn write_run_state(path: &Path, state: &mut RunState, now: DateTime<Utc>) -> Result<()> {
    state.updated_at = Some(now);
    debug!(path = %path.display(), run_id = ?state.run_id, iteration = state.iteration, "writing run state");
    write_json_atomic(path, state)
}

/// `rate-limit.json`: where a rate-limited run paused and when it may resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitCheckpoint {
    pub loop_id: String,
    pub run_id: String,
    pub iteration: u32,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    pub message: String,
    pub matched_line: String,
    pub recorded_at: DateTime<Utc>,
}

pub fn write_rate_limit_checkpoint(path: &Path, checkpoint: &RateLimitCheckpoint) -> Result<()> {
    debug!(path = %path.display(), reset_at = ?checkpoint.reset_at, "writing rate-limit checkpoint");
    write_json_atomic(path, checkpoint)
}

pub fn load_rate_limit_checkpoint(path: &Path) -> Result<Option<RateLimitCheckpoint>> {
    read_json_opt(path).with_context(|| format!("load rate-limit checkpoint {}", path.display()))
}
