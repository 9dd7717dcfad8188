//! Recovery policy decisions.
//!
//! Pure decision logic over an explicit [`RecoveryState`] value; the caller
//! loads and persists the state so budgets survive restarts within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What to do with a command that is in neither list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPolicy {
    Deny,
    Escalate,
    Allow,
}

/// Recovery configuration for one loop (`[loops.recovery]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    pub enabled: bool,
    /// Exact commands that may run without a human.
    pub auto_approve: Vec<String>,
    /// Exact commands or glob patterns that always need a human. Wins over `auto_approve`.
    pub require_human: Vec<String>,
    pub on_unknown: UnknownPolicy,
    /// Maximum executions per run.
    pub max_per_run: u32,
    /// Minimum seconds between executions.
    pub cooldown_secs: u64,
    /// Auto-approved proposals below this confidence are escalated.
    pub min_confidence: f64,
    /// Default timeout when the proposal does not carry one.
    pub timeout_secs: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_approve: Vec::new(),
            require_human: Vec::new(),
            on_unknown: UnknownPolicy::Escalate,
            max_per_run: 3,
            cooldown_secs: 60,
            min_confidence: 0.0,
            timeout_secs: 300,
        }
    }
}

/// Persisted recovery budget (`recovery/state.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub run_id: Option<String>,
    pub recoveries_this_run: u32,
    pub last_recovery_time: Option<DateTime<Utc>>,
}

impl RecoveryState {
    /// Record one execution, successful or not.
    pub fn record_execution(&mut self, now: DateTime<Utc>) {
        self.recoveries_this_run = self.recoveries_this_run.saturating_add(1);
        self.last_recovery_time = Some(now);
    }
}

/// Policy decision for one proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approved(String),
    Denied(String),
    Blocked(String),
    Escalated(String),
}

impl Decision {
    pub fn reason(&self) -> &str {
        match self {
            Decision::Approved(reason)
            | Decision::Denied(reason)
            | Decision::Blocked(reason)
            | Decision::Escalated(reason) => reason,
        }
    }
}

/// Decide whether `command` may run now.
///
/// Order: enable flag, `require_human`, `auto_approve`, `on_unknown`; approved
/// commands must then fit the per-run budget and cooldown window.
pub fn decide(
    policy: &RecoveryPolicy,
    state: &RecoveryState,
    command: &str,
    confidence: f64,
    now: DateTime<Utc>,
) -> Decision {
    if !policy.enabled {
        return Decision::Denied("recovery disabled".to_string());
    }

    let command = command.trim();
    if let Some(rule) = policy
        .require_human
        .iter()
        .find(|rule| matches_rule(rule, command))
    {
        return Decision::Blocked(format!("require_human match '{rule}'"));
    }

    let approved = if policy.auto_approve.iter().any(|allowed| allowed.trim() == command) {
        if confidence < policy.min_confidence {
            return Decision::Escalated(format!(
                "confidence {confidence:.2} below min_confidence {:.2}",
                policy.min_confidence
            ));
        }
        "auto_approve match".to_string()
    } else {
        match policy.on_unknown {
            UnknownPolicy::Deny => return Decision::Denied("unknown command".to_string()),
            UnknownPolicy::Escalate => {
                return Decision::Escalated("unknown command".to_string());
            }
            UnknownPolicy::Allow => "on_unknown=allow".to_string(),
        }
    };

    if state.recoveries_this_run >= policy.max_per_run {
        return Decision::Denied(format!(
            "budget exhausted ({}/{} this run)",
            state.recoveries_this_run, policy.max_per_run
        ));
    }
    if let Some(last) = state.last_recovery_time {
        let elapsed = now.signed_duration_since(last).num_seconds();
        let cooldown = i64::try_from(policy.cooldown_secs).unwrap_or(i64::MAX);
        if elapsed < cooldown {
            return Decision::Denied(format!(
                "cooldown active ({elapsed}s of {cooldown}s elapsed)"
            ));
        }
    }

    Decision::Approved(approved)
}

fn matches_rule(rule: &str, command: &str) -> bool {
    let rule = rule.trim();
    if rule == command {
        return true;
    }
    glob::Pattern::new(rule)
        .map(|pattern| pattern.matches(command))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy {
            enabled: true,
            auto_approve: vec!["npm ci".to_string(), "git clean -fdx".to_string()],
            require_human: vec!["git clean *".to_string(), "rm -rf /".to_string()],
            on_unknown: UnknownPolicy::Deny,
            max_per_run: 2,
            cooldown_secs: 60,
            min_confidence: 0.5,
            timeout_secs: 60,
        }
    }

    #[test]
    fn require_human_wins_over_auto_approve() {
        let decision = decide(
            &policy(),
            &RecoveryState::default(),
            "git clean -fdx",
            1.0,
            now(),
        );
        assert!(matches!(decision, Decision::Blocked(_)), "{decision:?}");
    }

    #[test]
    fn exact_auto_approve_is_approved() {
        let decision = decide(&policy(), &RecoveryState::default(), "npm ci", 0.9, now());
        assert!(matches!(decision, Decision::Approved(_)));
    }

    #[test]
    fn auto_approve_requires_exact_match() {
        let decision = decide(&policy(), &RecoveryState::default(), "npm ci --force", 0.9, now());
        assert_eq!(decision, Decision::Denied("unknown command".to_string()));
    }

    #[test]
    fn unknown_policy_variants() {
        let mut p = policy();
        p.on_unknown = UnknownPolicy::Escalate;
        assert!(matches!(
            decide(&p, &RecoveryState::default(), "make fix", 1.0, now()),
            Decision::Escalated(_)
        ));
        p.on_unknown = UnknownPolicy::Allow;
        assert!(matches!(
            decide(&p, &RecoveryState::default(), "make fix", 1.0, now()),
            Decision::Approved(_)
        ));
    }

    #[test]
    fn disabled_policy_denies_everything() {
        let mut p = policy();
        p.enabled = false;
        assert!(matches!(
            decide(&p, &RecoveryState::default(), "npm ci", 1.0, now()),
            Decision::Denied(_)
        ));
    }

    #[test]
    fn budget_and_cooldown_bound_executions() {
        let p = policy();
        let mut state = RecoveryState::default();
        state.record_execution(now());

        let too_soon = now() + chrono::Duration::seconds(10);
        assert!(matches!(
            decide(&p, &state, "npm ci", 1.0, too_soon),
            Decision::Denied(reason) if reason.contains("cooldown")
        ));

        let later = now() + chrono::Duration::seconds(120);
        assert!(matches!(
            decide(&p, &state, "npm ci", 1.0, later),
            Decision::Approved(_)
        ));

        state.record_execution(later);
        let much_later = later + chrono::Duration::seconds(600);
        assert!(matches!(
            decide(&p, &state, "npm ci", 1.0, much_later),
            Decision::Denied(reason) if reason.contains("budget")
        ));
    }

    #[test]
    fn low_confidence_is_escalated() {
        let decision = decide(&policy(), &RecoveryState::default(), "npm ci", 0.2, now());
        assert!(matches!(decision, Decision::Escalated(_)));
    }
}
