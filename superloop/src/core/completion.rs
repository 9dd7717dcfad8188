//! Completion rule for an iteration.
//!
//! `completion_ok ⟺ promise ∧ tests ∧ (¬validation_required ∨ validation)
//! ∧ checklist ∧ (¬evidence_required ∨ evidence) ∧ (¬approval_required ∨ approved)`.

use crate::core::types::{GateOutcomes, GatePolicy, GateStatus, PromiseOutcome};

/// Decision taken after gates are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// All gates pass and no approval is required.
    Complete,
    /// All gates pass; a human decision is required before completion.
    AwaitApproval,
    /// At least one gate (or the promise) fails.
    Continue,
}

/// True when promise and gates justify completion, ignoring approval.
pub fn candidate_ok(promise: &PromiseOutcome, gates: &GateOutcomes, policy: &GatePolicy) -> bool {
    promise.matched
        && gates.tests.ok
        && (!policy.validation_required || gates.validation.ok)
        && gates.checklist.ok
        && (!policy.evidence_required || gates.evidence.ok)
}

/// Full completion predicate including the approval checkpoint.
pub fn completion_ok(promise: &PromiseOutcome, gates: &GateOutcomes, policy: &GatePolicy) -> bool {
    candidate_ok(promise, gates, policy)
        && (!policy.approval_required || gates.approval.status == GateStatus::Approved)
}

pub fn verdict(promise: &PromiseOutcome, gates: &GateOutcomes, policy: &GatePolicy) -> Verdict {
    if !candidate_ok(promise, gates, policy) {
        return Verdict::Continue;
    }
    if policy.approval_required {
        return Verdict::AwaitApproval;
    }
    Verdict::Complete
}

/// Whether `on_promise` tests are due. A passing checklist also triggers them.
pub fn tests_due_on_promise(promise_matched: bool, checklist_ok: bool) -> bool {
    promise_matched || checklist_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::GateResult;

    fn promise(matched: bool) -> PromiseOutcome {
        PromiseOutcome {
            expected: "DONE".to_string(),
            text: matched.then(|| "DONE".to_string()),
            matched,
        }
    }

    fn passing() -> GateOutcomes {
        GateOutcomes {
            checklist: GateResult::passed(),
            tests: GateResult::passed(),
            validation: GateResult::passed(),
            evidence: GateResult::passed(),
            approval: GateResult::disabled(),
        }
    }

    #[test]
    fn every_term_of_the_rule_is_required() {
        let policy = GatePolicy {
            validation_required: true,
            evidence_required: true,
            approval_required: false,
        };
        assert!(completion_ok(&promise(true), &passing(), &policy));
        assert!(!completion_ok(&promise(false), &passing(), &policy));

        let mut gates = passing();
        gates.tests = GateResult::failed("exit 1");
        assert!(!completion_ok(&promise(true), &gates, &policy));

        let mut gates = passing();
        gates.checklist = GateResult::failed("2 remaining");
        assert!(!completion_ok(&promise(true), &gates, &policy));

        let mut gates = passing();
        gates.validation = GateResult::failed("blocking check failed");
        assert!(!completion_ok(&promise(true), &gates, &policy));

        let mut gates = passing();
        gates.evidence = GateResult::error("write failed");
        assert!(!completion_ok(&promise(true), &gates, &policy));
    }

    #[test]
    fn optional_gates_are_ignored_when_not_required() {
        let policy = GatePolicy::default();
        let mut gates = passing();
        gates.validation = GateResult::failed("advisory only");
        gates.evidence = GateResult::error("write failed");
        assert!(completion_ok(&promise(true), &gates, &policy));
        assert_eq!(verdict(&promise(true), &gates, &policy), Verdict::Complete);
    }

    #[test]
    fn approval_gates_completion_but_not_candidacy() {
        let policy = GatePolicy {
            approval_required: true,
            ..GatePolicy::default()
        };
        let mut gates = passing();
        gates.approval = GateResult {
            status: GateStatus::Pending,
            ok: false,
            detail: None,
        };
        assert!(candidate_ok(&promise(true), &gates, &policy));
        assert!(!completion_ok(&promise(true), &gates, &policy));
        assert_eq!(
            verdict(&promise(true), &gates, &policy),
            Verdict::AwaitApproval
        );

        gates.approval = GateResult {
            status: GateStatus::Approved,
            ok: true,
            detail: None,
        };
        assert!(completion_ok(&promise(true), &gates, &policy));
    }

    #[test]
    fn on_promise_tests_run_when_checklist_passes_without_promise() {
        assert!(tests_due_on_promise(true, false));
        assert!(tests_due_on_promise(false, true));
        assert!(!tests_due_on_promise(false, false));
    }
}
