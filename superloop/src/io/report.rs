//! Markdown renderings derived from persisted state.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::stuck::StuckState;
use crate::io::run_summary::RunSummary;

const TIMELINE_TEMPLATE: &str = include_str!("templates/timeline.md");
const STUCK_REPORT_TEMPLATE: &str = include_str!("templates/stuck_report.md");

static ENGINE: LazyLock<ReportEngine> = LazyLock::new(ReportEngine::new);

/// Template engine wrapper around minijinja.
struct ReportEngine {
    env: Environment<'static>,
}

impl ReportEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("timeline", TIMELINE_TEMPLATE)
            .expect("timeline template should be valid");
        env.add_template("stuck_report", STUCK_REPORT_TEMPLATE)
            .expect("stuck report template should be valid");
        Self { env }
    }
}

/// Flatten a run summary into `timeline.md`.
pub fn render_timeline(summary: &RunSummary) -> Result<String> {
    let template = ENGINE.env.get_template("timeline")?;
    Ok(template.render(context! {
        loop_id => &summary.loop_id,
        updated_at => summary.updated_at.to_rfc3339(),
        entries => &summary.entries,
    })?)
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckReportInput<'a> {
    pub loop_id: &'a str,
    pub run_id: &'a str,
    pub iteration: u32,
    pub state: &'a StuckState,
    pub failure_lines: &'a [String],
    pub unchecked: &'a [String],
}

pub fn render_stuck_report(input: &StuckReportInput<'_>) -> Result<String> {
    let template = ENGINE.env.get_template("stuck_report")?;
    Ok(template.render(context! {
        loop_id => input.loop_id,
        run_id => input.run_id,
        iteration => input.iteration,
        streak => input.state.streak,
        threshold => input.state.threshold,
        reason => input.state.reason.as_str(),
        code_signature => &input.state.code_signature,
        test_signature => &input.state.test_signature,
        failure_lines => input.failure_lines,
        unchecked => input.unchecked,
    })?)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::core::stuck::StuckReason;

    #[test]
    fn empty_timeline_names_the_loop() {
        let summary = RunSummary::new("main", DateTime::<Utc>::UNIX_EPOCH);
        let rendered = render_timeline(&summary).expect("render");
        assert!(rendered.starts_with("# Timeline: main"));
        assert!(rendered.contains("0 iteration(s) recorded"));
    }

    #[test]
    fn stuck_report_lists_failures_and_items() {
        let state = StuckState {
            run_id: "run-1".to_string(),
            code_signature: "abc".to_string(),
            test_signature: String::new(),
            streak: 3,
            threshold: 3,
            reason: StuckReason::NoCodeChanges,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        };
        let rendered = render_stuck_report(&StuckReportInput {
            loop_id: "main",
            run_id: "run-1",
            iteration: 4,
            state: &state,
            failure_lines: &["error: boom".to_string()],
            unchecked: &["README.md:3 write docs".to_string()],
        })
        .expect("render");
        assert!(rendered.contains("no_code_changes"));
        assert!(rendered.contains("- error: boom"));
        assert!(rendered.contains("- README.md:3 write docs"));
        assert!(rendered.contains("test signature: `(empty)`"));
        assert!(rendered.contains("resume from iteration 5"));
    }
}
