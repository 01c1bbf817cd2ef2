//! Test-only collaborators and builders for driving runs without a device.

use std::collections::VecDeque;
use std::fs;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::Value;

use crate::core::action::{ActionKind, ActionProposal, RawProposal};
use crate::core::classifier::{ScreenRule, UNKNOWN_SCREEN};
use crate::core::test_spec::{CaseConfig, CaseMeta, ReferenceStep, Subgoal, SuccessPredicate, TestSpec};
use crate::core::types::{
    ActionRecord, Bounds, ExecutionOutcome, ResultKind, Role, ScreenSnapshot, TestResult,
    UiElement, Verdict,
};
use crate::io::device::{DeviceError, DeviceExecutor, DeviceRequest, SnapshotProvider};
use crate::io::evaluator::{Evaluation, EvaluationRequest, Evaluator};
use crate::io::proposer::{ProposalRequest, Proposer};

fn element(text: &str, role: Role, center_y: i32, clickable: bool) -> UiElement {
    UiElement {
        text: text.to_string(),
        role,
        bounds: Bounds::new(100, center_y - 50, 980, center_y + 50),
        clickable,
    }
}

/// Clickable button centred at (540, `center_y`).
pub fn button(text: &str, center_y: i32) -> UiElement {
    element(text, Role::Button, center_y, true)
}

/// Clickable text field centred at (540, `center_y`).
pub fn input(text: &str, center_y: i32) -> UiElement {
    element(text, Role::Input, center_y, true)
}

/// Static, non-clickable label centred at (540, `center_y`).
pub fn text_el(text: &str, center_y: i32) -> UiElement {
    element(text, Role::Text, center_y, false)
}

pub fn snapshot(screen_type: &str, elements: Vec<UiElement>) -> ScreenSnapshot {
    ScreenSnapshot::new(elements, screen_type)
}

/// Successful record on an unknown screen with zero reward.
pub fn record(step: u32, action: ActionProposal) -> ActionRecord {
    let now = Utc::now();
    ActionRecord {
        step,
        action,
        overridden: false,
        proposed: None,
        element: None,
        outcome: ExecutionOutcome {
            success: true,
            message: "ok".to_string(),
            started_at: now,
            finished_at: now,
            failure: None,
        },
        screen_before: UNKNOWN_SCREEN.to_string(),
        screen_after: UNKNOWN_SCREEN.to_string(),
        new_subgoals: Vec::new(),
        reward: 0.0,
        reasoning: None,
    }
}

/// Temporary directory populated with `(file name, contents)` case files.
pub fn case_dir(files: &[(&str, &str)]) -> Result<tempfile::TempDir> {
    let dir = tempfile::tempdir().context("create temp case dir")?;
    for (name, contents) in files {
        let path = dir.path().join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(dir)
}

/// Fluent builder for [`TestSpec`] values.
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    spec: TestSpec,
}

impl SpecBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            spec: TestSpec {
                inputs: Vec::new(),
                meta: CaseMeta {
                    id: id.to_string(),
                    name: id.replace('-', " "),
                    goal: format!("Complete {id}"),
                    expected: TestResult::Pass,
                    app_package: None,
                },
                config: CaseConfig::default(),
                reference: Vec::new(),
                subgoals: Vec::new(),
                success: Vec::new(),
                screens: Vec::new(),
            },
        }
    }

    pub fn goal(mut self, goal: &str) -> Self {
        self.spec.meta.goal = goal.to_string();
        self
    }

    pub fn expected(mut self, expected: TestResult) -> Self {
        self.spec.meta.expected = expected;
        self
    }

    pub fn inputs(mut self, inputs: &[&str]) -> Self {
        self.spec.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn reference(mut self, kind: ActionKind, key: Option<&str>) -> Self {
        self.spec.reference.push(ReferenceStep {
            kind,
            key: key.map(str::to_string),
        });
        self
    }

    pub fn subgoal(mut self, name: &str, kinds: &[ActionKind], params_contain: &[&str]) -> Self {
        self.spec.subgoals.push(Subgoal {
            name: name.to_string(),
            kinds: kinds.to_vec(),
            params_contain: params_contain.iter().map(|s| s.to_string()).collect(),
            screen_after: None,
        });
        self
    }

    pub fn success(mut self, predicate: SuccessPredicate) -> Self {
        self.spec.success.push(predicate);
        self
    }

    pub fn screen(mut self, name: &str, contains_any: &[&str]) -> Self {
        self.spec.screens.push(ScreenRule {
            name: name.to_string(),
            contains_any: contains_any.iter().map(|s| s.to_string()).collect(),
            contains_all: Vec::new(),
        });
        self
    }

    pub fn build(self) -> TestSpec {
        self.spec
    }
}

/// One scripted proposer answer: a raw proposal, or an error from the backend.
pub type ScriptedAnswer = std::result::Result<RawProposal, String>;

/// Proposer that replays a fixed list of answers.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProposer {
    answers: Vec<ScriptedAnswer>,
    next: usize,
    cycle: bool,
    feedback: Vec<Option<String>>,
}

impl ScriptedProposer {
    pub fn new(answers: Vec<(&str, Value)>) -> Self {
        Self::from_answers(
            answers
                .into_iter()
                .map(|(kind, params)| Ok(RawProposal::new(kind, params)))
                .collect(),
        )
    }

    pub fn from_answers(answers: Vec<ScriptedAnswer>) -> Self {
        Self {
            answers,
            ..Self::default()
        }
    }

    /// Repeat the script from the start once it runs out.
    pub fn cycled(mut self) -> Self {
        self.cycle = true;
        self
    }

    /// Number of times the proposer was asked.
    pub fn calls(&self) -> usize {
        self.feedback.len()
    }

    /// Feedback passed with each request, in call order.
    pub fn feedback(&self) -> &[Option<String>] {
        &self.feedback
    }
}

impl Proposer for ScriptedProposer {
    fn propose(&mut self, request: &ProposalRequest<'_>) -> Result<RawProposal> {
        self.feedback.push(request.feedback.map(str::to_string));
        if self.next >= self.answers.len() {
            if !self.cycle || self.answers.is_empty() {
                return Err(anyhow!("proposer script exhausted"));
            }
            self.next = 0;
        }
        let answer = self.answers[self.next].clone();
        self.next += 1;
        answer.map_err(|msg| anyhow!(msg))
    }
}

/// Evaluator that gives one fixed answer and remembers what it was shown.
#[derive(Debug, Clone)]
pub struct ScriptedEvaluator {
    answer: std::result::Result<Evaluation, String>,
    seen: Vec<(Verdict, bool, usize)>,
}

impl ScriptedEvaluator {
    pub fn new(result: TestResult, kind: ResultKind, reasoning: &str) -> Self {
        Self {
            answer: Ok(Evaluation {
                result,
                result_kind: kind,
                reasoning: reasoning.to_string(),
                bug_report: None,
            }),
            seen: Vec::new(),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            answer: Err(message.to_string()),
            seen: Vec::new(),
        }
    }

    pub fn with_bug_report(mut self, report: &str) -> Self {
        if let Ok(answer) = &mut self.answer {
            answer.bug_report = Some(report.to_string());
        }
        self
    }

    /// Runner verdict, overridable flag, and history length per call.
    pub fn seen(&self) -> &[(Verdict, bool, usize)] {
        &self.seen
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&mut self, request: &EvaluationRequest<'_>) -> Result<Evaluation> {
        self.seen.push((
            request.verdict.clone(),
            request.overridable,
            request.history.len(),
        ));
        self.answer.clone().map_err(|msg| anyhow!(msg))
    }
}

/// Scripted result of one device execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedExec {
    Ok,
    /// Device answered but reported failure.
    Rejected(String),
    Err(DeviceError),
}

/// Device that serves queued snapshots and execution results.
///
/// Once the snapshot queue is down to one entry that snapshot is served
/// forever; executions default to success once their queue is empty.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDevice {
    snapshots: VecDeque<ScreenSnapshot>,
    capture_errors: VecDeque<DeviceError>,
    execs: VecDeque<ScriptedExec>,
    executed: Vec<ActionProposal>,
    attempts: usize,
    captures: usize,
    capture_limit: Option<usize>,
}

impl ScriptedDevice {
    pub fn new(snapshots: Vec<ScreenSnapshot>) -> Self {
        Self {
            snapshots: snapshots.into(),
            ..Self::default()
        }
    }

    pub fn with_execs(mut self, execs: Vec<ScriptedExec>) -> Self {
        self.execs = execs.into();
        self
    }

    /// Errors returned by the next captures, before any snapshot is served.
    pub fn with_capture_errors(mut self, errors: Vec<DeviceError>) -> Self {
        self.capture_errors = errors.into();
        self
    }

    /// Fail every capture after the first `limit`.
    pub fn with_capture_limit(mut self, limit: usize) -> Self {
        self.capture_limit = Some(limit);
        self
    }

    /// Actions the device answered for, whether or not they took effect.
    pub fn executed(&self) -> &[ActionProposal] {
        &self.executed
    }

    /// Every execute call including retries.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn captures(&self) -> usize {
        self.captures
    }
}

impl SnapshotProvider for ScriptedDevice {
    fn capture(&mut self, _timeout: std::time::Duration) -> Result<ScreenSnapshot, DeviceError> {
        self.captures += 1;
        if self.capture_limit.is_some_and(|limit| self.captures > limit) {
            return Err(DeviceError::Unavailable("capture limit reached".to_string()));
        }
        if let Some(err) = self.capture_errors.pop_front() {
            return Err(err);
        }
        let snapshot = if self.snapshots.len() > 1 {
            self.snapshots.pop_front()
        } else {
            self.snapshots.front().cloned()
        };
        snapshot.ok_or_else(|| DeviceError::Unavailable("no scripted snapshot".to_string()))
    }
}

impl DeviceExecutor for ScriptedDevice {
    fn execute(&mut self, request: &DeviceRequest<'_>) -> Result<ExecutionOutcome, DeviceError> {
        let started_at = Utc::now();
        self.attempts += 1;
        let exec = self.execs.pop_front().unwrap_or(ScriptedExec::Ok);
        if !matches!(exec, ScriptedExec::Err(_)) {
            self.executed.push(request.action.clone());
        }
        match exec {
            ScriptedExec::Ok => Ok(ExecutionOutcome::succeeded(
                format!("executed {}", request.action),
                started_at,
            )),
            ScriptedExec::Rejected(message) => Ok(ExecutionOutcome {
                success: false,
                message,
                started_at,
                finished_at: Utc::now(),
                failure: None,
            }),
            ScriptedExec::Err(err) => Err(err),
        }
    }
}
