//! Orchestration for a single control-loop step.
//!
//! One step asks the proposer (re-prompting once on a malformed answer),
//! applies sequencing overrides, resolves the target, dispatches exactly one
//! device call with bounded retries, captures the resulting screen, and
//! appends one [`ActionRecord`]. Termination checks live in [`crate::looping`].

use std::thread;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::action::{ActionProposal, parse_proposal};
use crate::core::budget::Cancellation;
use crate::core::classifier::UNKNOWN_SCREEN;
use crate::core::metrics::newly_achieved;
use crate::core::run_state::RunState;
use crate::core::sequencer::{Located, Selected, Sequencer};
use crate::core::test_spec::TestSpec;
use crate::core::types::{
    ActionRecord, ExecutionOutcome, ResultKind, ScreenSnapshot, StepFailure, TestResult, Verdict,
};
use crate::io::config::RunnerConfig;
use crate::io::device::{DeviceError, DeviceExecutor, DeviceRequest, SnapshotProvider};
use crate::io::proposer::{ProposalRequest, Proposer};

/// Fixed inputs shared by every step of a run.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub spec: &'a TestSpec,
    pub config: &'a RunnerConfig,
    pub sequencer: &'a Sequencer,
    pub cancel: &'a Cancellation,
}

/// Result of a single step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// A record was appended; the run continues from `snapshot`.
    Recorded { snapshot: ScreenSnapshot },
    /// The step ended the run. A record may or may not have been appended.
    Finished { verdict: Verdict },
}

/// A device call that kept failing.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFailure {
    pub attempts: u32,
    pub error: DeviceError,
}

/// Run `call`, retrying transient device errors with doubling backoff.
pub fn with_retries<T>(
    config: &RunnerConfig,
    what: &str,
    mut call: impl FnMut() -> Result<T, DeviceError>,
) -> Result<T, DeviceFailure> {
    let mut attempts = 1u32;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempts <= config.device_retries => {
                let backoff = config.retry_backoff(attempts);
                warn!(
                    what,
                    attempt = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    err = %error,
                    "device call failed, retrying"
                );
                thread::sleep(backoff);
                attempts += 1;
            }
            Err(error) => return Err(DeviceFailure { attempts, error }),
        }
    }
}

/// Capture the screen with the configured retry policy.
pub fn capture_snapshot<D: SnapshotProvider>(
    ctx: &StepContext<'_>,
    device: &mut D,
) -> Result<ScreenSnapshot, DeviceFailure> {
    let timeout = ctx.cancel.bound(ctx.config.step_timeout());
    with_retries(ctx.config, "capture", || device.capture(timeout))
}

/// Execute one step against `snapshot` and append its record to `state`.
#[instrument(skip_all, fields(step = state.next_step(), sequencer = state.sequencer_state().name()))]
pub fn run_step<D, P>(
    ctx: &StepContext<'_>,
    state: &mut RunState,
    device: &mut D,
    proposer: &mut P,
    snapshot: &ScreenSnapshot,
) -> Result<StepOutcome>
where
    D: SnapshotProvider + DeviceExecutor,
    P: Proposer,
{
    let (proposal, reasoning) = match propose(ctx, state, proposer, snapshot) {
        Ok(proposed) => proposed,
        Err(rejection) => {
            return Ok(StepOutcome::Finished {
                verdict: Verdict::execution_error(format!(
                    "two consecutive malformed proposals: {rejection}"
                )),
            });
        }
    };

    let selected = ctx
        .sequencer
        .select(state.sequencer_state(), state.text_entries(), proposal);
    if let Some(violation) = selected.violation(state.sequencer_state()) {
        info!(%violation, dispatched = %selected.action, "sequence override");
    }

    let started_at = Utc::now();
    let draft = Draft {
        step: state.next_step(),
        selected: &selected,
        reasoning,
        screen_before: &snapshot.screen_type,
    };

    if selected.action.kind().is_terminal() {
        let verdict = declared_verdict(&selected.action, state);
        let outcome = ExecutionOutcome::succeeded(format!("declared {}", selected.action), started_at);
        let record = draft.finish(ctx, state, None, outcome, &snapshot.screen_type);
        state.append(record)?;
        return Ok(StepOutcome::Finished { verdict });
    }

    let located = match ctx.sequencer.locate(&selected, snapshot) {
        Ok(located) => located,
        Err(not_found) => {
            info!(missing = %not_found.target, "target not on screen");
            let outcome = ExecutionOutcome::failed(
                not_found.to_string(),
                started_at,
                StepFailure::ElementNotFound {
                    target: not_found.target.clone(),
                },
            );
            let record = draft.finish(ctx, state, None, outcome, &snapshot.screen_type);
            state.append(record)?;
            return Ok(StepOutcome::Recorded {
                snapshot: snapshot.clone(),
            });
        }
    };

    let timeout = ctx.cancel.bound(ctx.config.step_timeout());
    let request = DeviceRequest {
        action: &selected.action,
        element: located.element.as_ref(),
        timeout,
    };
    let (outcome, device_failure) =
        match with_retries(ctx.config, selected.action.kind().as_str(), || {
            device.execute(&request)
        }) {
            Ok(outcome) if outcome.success => (outcome, None),
            Ok(mut outcome) => {
                outcome.failure.get_or_insert(StepFailure::Rejected);
                (outcome, None)
            }
            Err(failure) => {
                let outcome = ExecutionOutcome::failed(
                    failure.error.to_string(),
                    started_at,
                    StepFailure::Device {
                        attempts: failure.attempts,
                        error: failure.error.to_string(),
                    },
                );
                (outcome, Some(failure))
            }
        };
    debug!(success = outcome.success, message = %outcome.message, "device answered");

    if let Some(failure) = device_failure
        && selected.mandatory
    {
        let record = draft.finish(ctx, state, Some(&located), outcome, &snapshot.screen_type);
        state.append(record)?;
        return Ok(StepOutcome::Finished {
            verdict: Verdict::execution_error(format!(
                "device failed on mandatory {} after {} attempts: {}",
                selected.action.kind(),
                failure.attempts,
                failure.error
            )),
        });
    }

    let after = match capture_snapshot(ctx, device) {
        Ok(after) => after,
        Err(failure) => {
            let record = draft.finish(ctx, state, Some(&located), outcome, UNKNOWN_SCREEN);
            state.append(record)?;
            return Ok(StepOutcome::Finished {
                verdict: Verdict::execution_error(format!(
                    "screen capture failed after {} attempts: {}",
                    failure.attempts, failure.error
                )),
            });
        }
    };

    if outcome.success {
        let next = ctx
            .sequencer
            .advance(state.sequencer_state(), &selected, &located);
        if next != *state.sequencer_state() {
            debug!(from = state.sequencer_state().name(), to = next.name(), "sequencer transition");
        }
        state.set_sequencer_state(next);
    }
    let record = draft.finish(ctx, state, Some(&located), outcome, &after.screen_type);
    state.append(record)?;
    Ok(StepOutcome::Recorded { snapshot: after })
}

/// Ask for a proposal, re-prompting once with feedback when the first
/// answer is malformed. Returns the second rejection message on failure.
fn propose<P: Proposer>(
    ctx: &StepContext<'_>,
    state: &RunState,
    proposer: &mut P,
    snapshot: &ScreenSnapshot,
) -> Result<(ActionProposal, Option<String>), String> {
    let mut feedback: Option<String> = None;
    loop {
        let request = ProposalRequest {
            spec: ctx.spec,
            history: state.history(),
            snapshot,
            feedback: feedback.as_deref(),
        };
        let rejection = match proposer.propose(&request) {
            Ok(raw) => match parse_proposal(&raw) {
                Ok(proposal) => return Ok((proposal, raw.reasoning)),
                Err(err) => err.to_string(),
            },
            Err(err) => format!("{err:#}"),
        };
        if feedback.is_some() {
            warn!(reason = %rejection, "second malformed proposal");
            return Err(rejection);
        }
        warn!(reason = %rejection, "malformed proposal, re-prompting");
        feedback = Some(rejection);
    }
}

fn declared_verdict(action: &ActionProposal, state: &RunState) -> Verdict {
    let not_found = state
        .last()
        .is_some_and(|record| record.outcome.is_element_not_found());
    let failed_kind = if not_found {
        ResultKind::ElementNotFound
    } else {
        ResultKind::TestAssertionFailed
    };
    match action {
        ActionProposal::DeclareDone {
            result: TestResult::Pass,
            reason,
        } => Verdict::passed(reason.clone()),
        ActionProposal::DeclareDone { reason, .. } | ActionProposal::DeclareFailed { reason } => {
            Verdict::failed(failed_kind, reason.clone())
        }
        other => Verdict::execution_error(format!("{other} is not a declaration")),
    }
}

/// Record fields known before the outcome.
struct Draft<'a> {
    step: u32,
    selected: &'a Selected,
    reasoning: Option<String>,
    screen_before: &'a str,
}

impl Draft<'_> {
    fn finish(
        self,
        ctx: &StepContext<'_>,
        state: &RunState,
        located: Option<&Located>,
        outcome: ExecutionOutcome,
        screen_after: &str,
    ) -> ActionRecord {
        let new_subgoals = if outcome.success {
            newly_achieved(
                &ctx.spec.subgoals,
                state.achieved(),
                &self.selected.action,
                screen_after,
            )
        } else {
            Vec::new()
        };
        ActionRecord {
            step: self.step,
            action: self.selected.action.clone(),
            overridden: self.selected.overridden(),
            proposed: self.selected.replaced.clone(),
            element: located.and_then(|l| l.element.clone()),
            outcome,
            screen_before: self.screen_before.to_string(),
            screen_after: screen_after.to_string(),
            reward: ctx.config.reward.step_reward(new_subgoals.len()),
            new_subgoals,
            reasoning: self.reasoning,
        }
    }
}
