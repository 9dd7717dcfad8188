//! Append-only event ledger (`events.jsonl`).
//!
//! One JSON object per line, flushed per append. Optional envelope fields are
//! omitted when empty. The total order of events is emission order.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LoopStart,
    IterationStart,
    RoleStart,
    RoleEnd,
    RoleTimeout,
    RateLimited,
    SessionStart,
    SessionEnd,
    PromiseChecked,
    GateResult,
    GatesEvaluated,
    StuckCheck,
    StuckHalt,
    ApprovalRequested,
    ApprovalConsumed,
    IterationEnd,
    LoopComplete,
    MaxIterationsReached,
    RecoveryProposed,
    RecoveryApproved,
    RecoveryDenied,
    RecoveryBlocked,
    RecoveryEscalated,
    RecoveryExecuted,
    RecoveryFailed,
}

/// Event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub event: EventKind,
    pub loop_id: String,
    pub run_id: String,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Event {
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Writer bound to one loop and run.
#[derive(Debug, Clone)]
pub struct EventLedger {
    path: PathBuf,
    loop_id: String,
    run_id: String,
}

impl EventLedger {
    pub fn new(path: impl Into<PathBuf>, loop_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            loop_id: loop_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Start an envelope stamped with the current time.
    pub fn event(&self, kind: EventKind, iteration: u32) -> Event {
        Event {
            timestamp: Utc::now(),
            event: kind,
            loop_id: self.loop_id.clone(),
            run_id: self.run_id.clone(),
            iteration,
            role: None,
            status: None,
            message: None,
            data: empty_object(),
        }
    }

    /// Append one event as a single line.
    pub fn append(&self, event: &Event) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append ledger {}", self.path.display()))?;
        file.flush().ok();
        debug!(event = ?event.event, iteration = event.iteration, "event appended");
        Ok(())
    }

    /// Shorthand for `append(event(kind, iteration))` with a customization hook.
    pub fn emit(&self, kind: EventKind, iteration: u32, build: impl FnOnce(Event) -> Event) -> Result<()> {
        self.append(&build(self.event(kind, iteration)))
    }
}

/// Read every event; a malformed final line (interrupted write) is skipped.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut events = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        match serde_json::from_str::<Event>(line) {
            Ok(event) => events.push(event),
            Err(err) if idx + 1 == lines.len() => {
                warn!(err = %err, "skipping truncated final ledger line");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("parse {} line {}", path.display(), idx + 1));
            }
        }
    }
    Ok(events)
}

/// State derived by folding the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerView {
    pub events: usize,
    /// Run ids in first-seen order.
    pub run_ids: Vec<String>,
    pub iterations_started: u32,
    pub last_iteration: Option<u32>,
    pub roles_finished: u32,
    pub recoveries_executed: u32,
    /// A `loop_complete` was seen after the last `loop_start`.
    pub completed: bool,
    pub awaiting_approval: bool,
    pub last_event: Option<EventKind>,
}

/// Derive a [`LedgerView`]. Any prefix of a ledger replays to a consistent view.
pub fn replay(events: &[Event]) -> LedgerView {
    let mut view = LedgerView::default();
    for event in events {
        view.events += 1;
        if !view.run_ids.contains(&event.run_id) {
            view.run_ids.push(event.run_id.clone());
        }
        match event.event {
            EventKind::LoopStart => {
                view.completed = false;
                view.awaiting_approval = false;
            }
            EventKind::IterationStart => {
                view.iterations_started += 1;
                view.last_iteration = Some(event.iteration);
            }
            EventKind::RoleEnd => view.roles_finished += 1,
            EventKind::RecoveryExecuted => view.recoveries_executed += 1,
            EventKind::ApprovalRequested => view.awaiting_approval = true,
            EventKind::ApprovalConsumed => view.awaiting_approval = false,
            EventKind::LoopComplete => view.completed = true,
            _ => {}
        }
        view.last_event = Some(event.event);
    }
    view
}
