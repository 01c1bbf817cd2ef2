//! Success, loop, and step-budget checks.

use serde::{Deserialize, Serialize};

use crate::core::test_spec::SuccessPredicate;
use crate::core::types::{ActionRecord, ScreenSnapshot, Verdict};

/// Default hard ceiling on steps per run.
pub const DEFAULT_MAX_STEPS: u32 = 20;

/// Identical trailing signatures that count as repetition.
pub const REPEAT_WINDOW: usize = 3;

/// Trailing signatures inspected for A,B,A,B oscillation.
pub const OSCILLATION_WINDOW: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPattern {
    Repeating,
    Oscillating,
}

impl LoopPattern {
    pub fn reason(self) -> &'static str {
        match self {
            LoopPattern::Repeating => "stuck repeating",
            LoopPattern::Oscillating => "stuck oscillating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationDetector {
    max_steps: u32,
}

impl Default for TerminationDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STEPS)
    }
}

impl TerminationDetector {
    pub fn new(max_steps: u32) -> Self {
        Self { max_steps }
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// PASS verdict when any predicate holds on `snapshot`.
    pub fn check_success(
        &self,
        predicates: &[SuccessPredicate],
        snapshot: &ScreenSnapshot,
    ) -> Option<Verdict> {
        predicates
            .iter()
            .find(|predicate| predicate.holds(snapshot))
            .map(|predicate| Verdict::passed(format!("success predicate held: {}", predicate.describe())))
    }

    /// Loop verdict for `history`. Call right after each append so detection
    /// happens on the exact record that completes the pattern.
    pub fn check_loop(&self, history: &[ActionRecord]) -> Option<Verdict> {
        let pattern = detect_loop(history)?;
        let last = history.last().map(ActionRecord::signature).unwrap_or_default();
        Some(Verdict::execution_error(format!("{}: {last}", pattern.reason())))
    }

    pub fn budget_exhausted(&self, steps: u32) -> bool {
        steps >= self.max_steps
    }

    pub fn budget_verdict(&self) -> Verdict {
        Verdict::execution_error(format!(
            "step budget exhausted after {} steps without reaching the goal",
            self.max_steps
        ))
    }
}

/// Inspect the trailing signatures of `history` for repetition or oscillation.
pub fn detect_loop(history: &[ActionRecord]) -> Option<LoopPattern> {
    let tail: Vec<String> = history
        .iter()
        .rev()
        .take(OSCILLATION_WINDOW)
        .map(ActionRecord::signature)
        .collect();
    // tail[0] is the most recent record.
    if tail.len() >= REPEAT_WINDOW && tail[..REPEAT_WINDOW].iter().all(|sig| *sig == tail[0]) {
        return Some(LoopPattern::Repeating);
    }
    if tail.len() == OSCILLATION_WINDOW
        && tail[0] == tail[2]
        && tail[1] == tail[3]
        && tail[0] != tail[1]
    {
        return Some(LoopPattern::Oscillating);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::ActionProposal;
    use crate::core::types::{ExecutionOutcome, ResultKind};
    use chrono::Utc;

    fn record(step: u32, action: ActionProposal) -> ActionRecord {
        ActionRecord {
            step,
            action,
            overridden: false,
            proposed: None,
            element: None,
            outcome: ExecutionOutcome::succeeded("ok", Utc::now()),
            screen_before: "unknown".to_string(),
            screen_after: "unknown".to_string(),
            new_subgoals: Vec::new(),
            reward: -0.05,
            reasoning: None,
        }
    }

    fn tap(text: &str) -> ActionProposal {
        ActionProposal::TapByTarget {
            text: text.to_string(),
        }
    }

    fn history(actions: &[ActionProposal]) -> Vec<ActionRecord> {
        actions
            .iter()
            .enumerate()
            .map(|(idx, action)| record(idx as u32 + 1, action.clone()))
            .collect()
    }

    #[test]
    fn two_repeats_are_not_a_loop() {
        assert_eq!(detect_loop(&history(&[tap("Settings"), tap("Settings")])), None);
    }

    #[test]
    fn third_identical_signature_is_a_loop() {
        let h = history(&[tap("Settings"), tap("settings "), tap("SETTINGS")]);
        assert_eq!(detect_loop(&h), Some(LoopPattern::Repeating));
    }

    #[test]
    fn repetition_is_checked_on_the_trailing_window_only() {
        let h = history(&[tap("A"), tap("A"), tap("B"), tap("A")]);
        assert_eq!(detect_loop(&h), None);
    }

    #[test]
    fn alternating_pattern_is_oscillation() {
        let h = history(&[
            tap("Sync"),
            ActionProposal::NavigateBack,
            tap("Sync"),
            ActionProposal::NavigateBack,
        ]);
        assert_eq!(detect_loop(&h), Some(LoopPattern::Oscillating));
        assert_eq!(detect_loop(&h[..3]), None);
    }

    #[test]
    fn loop_verdict_is_an_execution_error_with_reason() {
        let detector = TerminationDetector::default();
        let h = history(&[ActionProposal::Confirm, ActionProposal::Confirm, ActionProposal::Confirm]);
        let verdict = detector.check_loop(&h).expect("loop");
        assert_eq!(verdict.kind, ResultKind::ExecutionError);
        assert!(verdict.reasoning.starts_with("stuck repeating"));
    }

    #[test]
    fn budget_is_exhausted_at_the_ceiling() {
        let detector = TerminationDetector::new(20);
        assert!(!detector.budget_exhausted(19));
        assert!(detector.budget_exhausted(20));
    }

    #[test]
    fn success_uses_first_holding_predicate() {
        let detector = TerminationDetector::default();
        let snapshot = ScreenSnapshot::new(Vec::new(), "inside_vault");
        let predicates = vec![
            SuccessPredicate::TextContainsAny(vec!["never".to_string()]),
            SuccessPredicate::ScreenIs("inside_vault".to_string()),
        ];
        let verdict = detector.check_success(&predicates, &snapshot).expect("pass");
        assert!(verdict.is_pass());
        assert!(verdict.reasoning.contains("screen is inside_vault"));
    }
}
