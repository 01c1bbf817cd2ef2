//! Reward shaping and plan-quality metrics.
//!
//! Everything is recomputed from the ordered history, so a persisted run can
//! be re-scored with a different reward table.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::action::ActionProposal;
use crate::core::test_spec::{ReferenceStep, Subgoal, TestSpec};
use crate::core::types::{ActionRecord, Verdict};

/// Per-step and per-run reward constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Added once per step (negative).
    pub step_penalty: f64,
    /// Added once per newly achieved subgoal.
    pub subgoal_reward: f64,
    /// Added once when the verdict is PASS.
    pub completion_bonus: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            step_penalty: -0.05,
            subgoal_reward: 0.20,
            completion_bonus: 1.00,
        }
    }
}

impl RewardConfig {
    pub fn step_reward(&self, newly_achieved: usize) -> f64 {
        self.step_penalty + self.subgoal_reward * newly_achieved as f64
    }
}

/// Subgoals credited by `action` that were not already achieved.
///
/// Returned in declaration order; a name never appears twice.
pub fn newly_achieved(
    subgoals: &[Subgoal],
    achieved: &BTreeSet<String>,
    action: &ActionProposal,
    screen_after: &str,
) -> Vec<String> {
    let mut fresh: Vec<String> = Vec::new();
    for subgoal in subgoals {
        if achieved.contains(&subgoal.name) || fresh.contains(&subgoal.name) {
            continue;
        }
        if subgoal.holds(action, screen_after) {
            fresh.push(subgoal.name.clone());
        }
    }
    fresh
}

/// Greedy left-to-right alignment of `history` against `reference`.
///
/// Each reference step consumes the first not-yet-consumed record at or
/// after the previous match that satisfies it. Returns the matched count.
pub fn matched_reference_steps(history: &[ActionRecord], reference: &[ReferenceStep]) -> usize {
    let mut cursor = 0usize;
    let mut matched = 0usize;
    for step in reference {
        let Some(offset) = history[cursor..]
            .iter()
            .position(|record| step.matches(&record.action))
        else {
            continue;
        };
        matched += 1;
        cursor += offset + 1;
        if cursor >= history.len() {
            break;
        }
    }
    matched
}

pub fn plan_adherence(matched: usize, reference_len: usize) -> f64 {
    ratio(matched, reference_len)
}

/// `min(1, reference / steps)`. A run that took no steps wasted none.
pub fn action_efficiency(reference_len: usize, steps: usize) -> f64 {
    if steps == 0 {
        return 1.0;
    }
    (reference_len as f64 / steps as f64).min(1.0)
}

pub fn subgoal_completion_rate(achieved: usize, total: usize) -> f64 {
    ratio(achieved, total)
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    (numerator as f64 / denominator as f64).clamp(0.0, 1.0)
}

/// Reward and quality summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub total: f64,
    pub step_penalty_total: f64,
    pub subgoal_bonus_total: f64,
    pub completion_bonus: f64,
    pub plan_adherence: f64,
    pub action_efficiency: f64,
    pub subgoal_completion_rate: f64,
    pub steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub matched_reference_steps: usize,
    pub reference_steps: usize,
    pub achieved_subgoals: Vec<String>,
    pub total_subgoals: usize,
    pub matches_expected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub mean_step_ms: f64,
}

/// Score a finished run.
///
/// Subgoal credit is re-derived from the history in step order so the
/// breakdown depends only on the history, the case, and `config`.
pub fn summarize(
    config: &RewardConfig,
    spec: &TestSpec,
    history: &[ActionRecord],
    verdict: &Verdict,
    duration_ms: Option<i64>,
) -> RewardBreakdown {
    let mut achieved: BTreeSet<String> = BTreeSet::new();
    let mut order: Vec<String> = Vec::new();
    for record in history.iter().filter(|r| r.outcome.success) {
        for name in newly_achieved(&spec.subgoals, &achieved, &record.action, &record.screen_after) {
            achieved.insert(name.clone());
            order.push(name);
        }
    }

    let steps = history.len();
    let successful_steps = history.iter().filter(|r| r.outcome.success).count();
    let step_penalty_total = config.step_penalty * steps as f64;
    let subgoal_bonus_total = config.subgoal_reward * order.len() as f64;
    let completion_bonus = if verdict.is_pass() {
        config.completion_bonus
    } else {
        0.0
    };
    let matched = matched_reference_steps(history, &spec.reference);
    let mean_step_ms = if steps == 0 {
        0.0
    } else {
        history.iter().map(|r| r.outcome.duration_ms() as f64).sum::<f64>() / steps as f64
    };

    RewardBreakdown {
        total: step_penalty_total + subgoal_bonus_total + completion_bonus,
        step_penalty_total,
        subgoal_bonus_total,
        completion_bonus,
        plan_adherence: plan_adherence(matched, spec.reference.len()),
        action_efficiency: action_efficiency(spec.reference.len(), steps),
        subgoal_completion_rate: subgoal_completion_rate(order.len(), spec.subgoals.len()),
        steps,
        successful_steps,
        failed_steps: steps - successful_steps,
        matched_reference_steps: matched,
        reference_steps: spec.reference.len(),
        achieved_subgoals: order,
        total_subgoals: spec.subgoals.len(),
        matches_expected: verdict.result == spec.meta.expected,
        duration_ms,
        mean_step_ms,
    }
}
