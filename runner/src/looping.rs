//! Run orchestrator: drives steps until exactly one verdict is produced.
//!
//! Termination is checked at every step boundary in a fixed order: success
//! predicates on the current screen, loop detection over the history, the
//! step budget, then cancellation. Loop detection therefore fires right after
//! the record that completes the pattern, before any further device call.
//!
//! Once the loop ends an optional evaluator reviews the run. Only a verdict
//! from budget exhaustion can be replaced by its judgement.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::budget::Cancellation;
use crate::core::metrics::summarize;
use crate::core::resolver::Resolver;
use crate::core::run_state::RunState;
use crate::core::sequencer::Sequencer;
use crate::core::termination::TerminationDetector;
use crate::core::test_spec::TestSpec;
use crate::core::types::{ActionRecord, ResultKind, Verdict};
use crate::io::config::RunnerConfig;
use crate::io::device::{DeviceExecutor, SnapshotProvider};
use crate::io::evaluator::{EvaluationRequest, Evaluator, final_verdict};
use crate::io::proposer::Proposer;
use crate::io::run_record::RunRecord;
use crate::step::{StepContext, StepOutcome, capture_snapshot, run_step};

/// Run one test case to completion.
///
/// `on_step` sees each record right after it is appended. Errors are
/// reserved for broken internal invariants; every device, proposer, and
/// termination condition ends in a verdict inside the returned record.
/// Cancelled runs skip the evaluator.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(case = %spec.meta.id, run_id = %run_id))]
pub fn run_test<D, P, F>(
    spec: &TestSpec,
    config: &RunnerConfig,
    run_id: &str,
    device: &mut D,
    proposer: &mut P,
    evaluator: Option<&mut dyn Evaluator>,
    cancel: &Cancellation,
    mut on_step: F,
) -> Result<RunRecord>
where
    D: SnapshotProvider + DeviceExecutor,
    P: Proposer,
    F: FnMut(&ActionRecord),
{
    let started_at = Utc::now();
    let sequencer = Sequencer::new(
        Resolver::new(config.lower_region_y),
        config.popup_after_focus,
        spec,
    );
    let detector = TerminationDetector::new(config.max_steps);
    let ctx = StepContext {
        spec,
        config,
        sequencer: &sequencer,
        cancel,
    };
    let mut state = RunState::new();
    info!(max_steps = config.max_steps, "starting run");

    let (verdict, last_screen, overridable) = match capture_snapshot(&ctx, device) {
        Err(failure) => {
            warn!(err = %failure.error, "initial capture failed");
            let verdict = Verdict::execution_error(format!(
                "screen capture failed after {} attempts: {}",
                failure.attempts, failure.error
            ));
            (verdict, None, false)
        }
        Ok(mut snapshot) => loop {
            if let Some(verdict) = detector.check_success(&spec.success, &snapshot) {
                break (verdict, Some(snapshot), false);
            }
            if let Some(verdict) = detector.check_loop(state.history()) {
                break (verdict, Some(snapshot), false);
            }
            if detector.budget_exhausted(state.steps()) {
                break (detector.budget_verdict(), Some(snapshot), true);
            }
            if let Some(reason) = cancel.reason() {
                break (Verdict::aborted(reason), Some(snapshot), false);
            }

            let before = state.steps();
            let outcome = run_step(&ctx, &mut state, device, proposer, &snapshot)?;
            if state.steps() > before
                && let Some(record) = state.last()
            {
                on_step(record);
            }
            match outcome {
                StepOutcome::Recorded { snapshot: next } => snapshot = next,
                StepOutcome::Finished { verdict } => break (verdict, Some(snapshot), false),
            }
        },
    };

    let verdict = match evaluator {
        Some(evaluator) if verdict.kind != ResultKind::Aborted => final_verdict(
            evaluator,
            &EvaluationRequest {
                spec,
                history: state.history(),
                snapshot: last_screen.as_ref(),
                verdict: &verdict,
                overridable,
            },
        ),
        _ => verdict,
    };

    let verdict = state.conclude(verdict)?.clone();
    let finished_at = Utc::now();
    let duration_ms = (finished_at - started_at).num_milliseconds().max(0);
    let history = state.into_history();
    let reward = summarize(&config.reward, spec, &history, &verdict, Some(duration_ms));
    info!(
        result = %verdict.result,
        kind = %verdict.kind,
        steps = history.len(),
        reward = reward.total,
        reason = %verdict.reasoning,
        bug_report = verdict.bug_report.is_some(),
        "run finished"
    );

    Ok(RunRecord {
        run_id: run_id.to_string(),
        case_id: spec.meta.id.clone(),
        case_name: spec.meta.name.clone(),
        expected: spec.meta.expected,
        started_at,
        finished_at,
        reward_config: config.reward,
        history,
        reward,
        verdict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_spec::SuccessPredicate;
    use crate::core::types::ResultKind;
    use crate::test_support::{ScriptedDevice, ScriptedProposer, SpecBuilder, button, snapshot};
    use serde_json::json;

    #[test]
    fn success_on_first_screen_needs_no_proposal() {
        let spec = SpecBuilder::new("already-there")
            .success(SuccessPredicate::TextContainsAny(vec!["Welcome".to_string()]))
            .build();
        let mut device = ScriptedDevice::new(vec![snapshot("home", vec![button("Welcome", 400)])]);
        let mut proposer = ScriptedProposer::default();

        let record = run_test(
            &spec,
            &RunnerConfig::default(),
            "run-1",
            &mut device,
            &mut proposer,
            None,
            &Cancellation::new(),
            |_| {},
        )
        .expect("run");

        assert_eq!(record.verdict.kind, ResultKind::TestPassed);
        assert!(record.history.is_empty());
        assert_eq!(proposer.calls(), 0);
        assert!(record.reward.completion_bonus > 0.0);
    }

    #[test]
    fn initial_capture_failure_is_an_execution_error() {
        let spec = SpecBuilder::new("no-device").build();
        let mut device = ScriptedDevice::new(Vec::new());
        let mut proposer = ScriptedProposer::default();

        let record = run_test(
            &spec,
            &RunnerConfig::default(),
            "run-1",
            &mut device,
            &mut proposer,
            None,
            &Cancellation::new(),
            |_| {},
        )
        .expect("run");

        assert_eq!(record.verdict.kind, ResultKind::ExecutionError);
        assert!(record.verdict.reasoning.contains("screen capture failed"));
        assert_eq!(device.captures(), 1);
    }

    #[test]
    fn on_step_sees_every_record() {
        let spec = SpecBuilder::new("declare").build();
        let mut device = ScriptedDevice::new(vec![snapshot("home", vec![button("Next", 1800)])]);
        let mut proposer = ScriptedProposer::new(vec![
            ("tap-by-target", json!({"text": "Next"})),
            ("declare-done", json!({"result": "PASS", "reason": "looks right"})),
        ]);
        let mut seen = Vec::new();

        let record = run_test(
            &spec,
            &RunnerConfig::default(),
            "run-1",
            &mut device,
            &mut proposer,
            None,
            &Cancellation::new(),
            |record| seen.push(record.step),
        )
        .expect("run");

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(record.verdict.kind, ResultKind::TestPassed);
        assert_eq!(device.executed().len(), 1);
    }
}
