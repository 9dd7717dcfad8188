//! Stuck-streak bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why the streak last moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    /// A signature changed (or this is the first observation).
    Progressing,
    /// The working-tree signature repeated.
    NoCodeChanges,
    /// Only the test-failure signature could repeat, and it did.
    SameTestFailures,
}

impl StuckReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StuckReason::Progressing => "progressing",
            StuckReason::NoCodeChanges => "no_code_changes",
            StuckReason::SameTestFailures => "same_test_failures",
        }
    }
}

/// Persisted progress-detector state (`stuck.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckState {
    /// Run that produced this state; a new run starts a fresh streak.
    #[serde(default)]
    pub run_id: String,
    pub code_signature: String,
    pub test_signature: String,
    pub streak: u32,
    pub threshold: u32,
    pub reason: StuckReason,
    pub updated_at: DateTime<Utc>,
}

impl StuckState {
    /// True once the streak of unchanged iterations reaches the threshold.
    pub fn is_stuck(&self) -> bool {
        self.reason != StuckReason::Progressing && self.streak >= self.threshold
    }
}

/// Fold one observation into the previous state.
///
/// The first observation of a run or any signature change resets the streak
/// to 1. When both signatures repeat and at least one is non-empty the streak
/// grows.
pub fn advance(
    prev: Option<&StuckState>,
    run_id: &str,
    code_signature: String,
    test_signature: String,
    threshold: u32,
    now: DateTime<Utc>,
) -> StuckState {
    let (streak, reason) = match prev.filter(|prev| prev.run_id == run_id) {
        None => (1, StuckReason::Progressing),
        Some(prev) => {
            let code_same = prev.code_signature == code_signature;
            let test_same = prev.test_signature == test_signature;
            if !code_same || !test_same {
                (1, StuckReason::Progressing)
            } else if !code_signature.is_empty() {
                (prev.streak.saturating_add(1), StuckReason::NoCodeChanges)
            } else if !test_signature.is_empty() {
                (prev.streak.saturating_add(1), StuckReason::SameTestFailures)
            } else {
                (1, StuckReason::Progressing)
            }
        }
    };

    StuckState {
        run_id: run_id.to_string(),
        code_signature,
        test_signature,
        streak,
        threshold,
        reason,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    #[test]
    fn identical_tree_three_times_reaches_threshold() {
        let first = advance(None, "run-1", "c1".into(), String::new(), 3, now());
        assert_eq!(first.streak, 1);
        assert!(!first.is_stuck());

        let second = advance(Some(&first), "run-1", "c1".into(), String::new(), 3, now());
        assert_eq!(second.streak, 2);
        assert!(!second.is_stuck());

        let third = advance(Some(&second), "run-1", "c1".into(), String::new(), 3, now());
        assert_eq!(third.streak, 3);
        assert_eq!(third.reason, StuckReason::NoCodeChanges);
        assert!(third.is_stuck());
    }

    #[test]
    fn code_change_resets_even_with_same_test_failures() {
        let first = advance(None, "run-1", "c1".into(), "t1".into(), 3, now());
        let second = advance(Some(&first), "run-1", "c1".into(), "t1".into(), 3, now());
        assert_eq!(second.streak, 2);

        let third = advance(Some(&second), "run-1", "c2".into(), "t1".into(), 3, now());
        assert_eq!(third.streak, 1);
        assert_eq!(third.reason, StuckReason::Progressing);
    }

    #[test]
    fn test_signature_change_also_resets() {
        let first = advance(None, "run-1", "c1".into(), "t1".into(), 3, now());
        let second = advance(Some(&first), "run-1", "c1".into(), "t2".into(), 3, now());
        assert_eq!(second.streak, 1);
    }

    #[test]
    fn empty_code_signature_falls_back_to_test_failures() {
        let first = advance(None, "run-1", String::new(), "t1".into(), 2, now());
        let second = advance(Some(&first), "run-1", String::new(), "t1".into(), 2, now());
        assert_eq!(second.reason, StuckReason::SameTestFailures);
        assert!(second.is_stuck());
    }

    #[test]
    fn new_run_starts_a_fresh_streak() {
        let first = advance(None, "run-1", "c1".into(), String::new(), 2, now());
        let carried = advance(Some(&first), "run-2", "c1".into(), String::new(), 2, now());
        assert_eq!(carried.streak, 1);
        assert_eq!(carried.reason, StuckReason::Progressing);
        assert_eq!(carried.run_id, "run-2");

        let second = advance(Some(&carried), "run-2", "c1".into(), String::new(), 2, now());
        assert!(second.is_stuck());
    }

    #[test]
    fn two_empty_signatures_never_accumulate() {
        let first = advance(None, "run-1", String::new(), String::new(), 2, now());
        let second = advance(Some(&first), "run-1", String::new(), String::new(), 2, now());
        assert_eq!(second.streak, 1);
        assert!(!second.is_stuck());
    }
}
