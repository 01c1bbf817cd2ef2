//! Shared data types for screen observation, execution outcomes, and verdicts.
//!
//! Everything here is plain data: snapshots are produced by a device adapter,
//! records are produced by the orchestrator, and both are read-only once they
//! leave the function that built them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::action::ActionProposal;

/// Coarse widget role derived from the platform class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Button,
    Input,
    Text,
    Other,
}

impl Role {
    /// Map an Android widget class (e.g. `android.widget.EditText`) to a role.
    pub fn from_class(class: &str) -> Self {
        let short = class.rsplit('.').next().unwrap_or(class);
        if short.contains("EditText") || short.contains("TextField") {
            Role::Input
        } else if short.contains("Button") {
            Role::Button
        } else if short.contains("TextView") || short == "Text" {
            Role::Text
        } else {
            Role::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Button => "button",
            Role::Input => "input",
            Role::Text => "text",
            Role::Other => "other",
        }
    }
}

/// Screen-space rectangle in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn center(&self) -> (i32, i32) {
        (
            (self.left + self.right) / 2,
            (self.top + self.bottom) / 2,
        )
    }
}

/// One visible node of the on-screen view hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiElement {
    /// Visible text, or the accessibility description when the text is empty.
    pub text: String,
    pub role: Role,
    pub bounds: Bounds,
    pub clickable: bool,
}

impl UiElement {
    pub fn center(&self) -> (i32, i32) {
        self.bounds.center()
    }

    pub fn center_y(&self) -> i32 {
        self.bounds.center().1
    }

    pub fn is_interactive(&self) -> bool {
        self.clickable || matches!(self.role, Role::Button | Role::Input)
    }
}

/// Observation of the device screen at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenSnapshot {
    pub elements: Vec<UiElement>,
    /// Coarse screen classification label (`unknown` when no rule matched).
    pub screen_type: String,
    pub captured_at: DateTime<Utc>,
}

impl ScreenSnapshot {
    pub fn new(elements: Vec<UiElement>, screen_type: impl Into<String>) -> Self {
        Self {
            elements,
            screen_type: screen_type.into(),
            captured_at: Utc::now(),
        }
    }

    /// Aggregated visible text: every non-empty element text, normalized and
    /// joined by newlines in snapshot order.
    pub fn visible_text(&self) -> String {
        self.elements
            .iter()
            .map(|element| normalize_text(&element.text))
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Lowercase, trim, and collapse internal whitespace runs to single spaces.
pub fn normalize_text(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Why a step did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepFailure {
    /// The target could not be located; nothing was dispatched.
    ElementNotFound { target: String },
    /// Device I/O kept failing after all retries.
    Device { attempts: u32, error: String },
    /// The device accepted the call but reported that the action failed.
    Rejected,
}

/// What the device reported for one dispatched action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
}

impl ExecutionOutcome {
    pub fn succeeded(message: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            message: message.into(),
            started_at,
            finished_at: Utc::now(),
            failure: None,
        }
    }

    pub fn failed(
        message: impl Into<String>,
        started_at: DateTime<Utc>,
        failure: StepFailure,
    ) -> Self {
        Self {
            success: false,
            message: message.into(),
            started_at,
            finished_at: Utc::now(),
            failure: Some(failure),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0)
    }

    pub fn is_element_not_found(&self) -> bool {
        matches!(self.failure, Some(StepFailure::ElementNotFound { .. }))
    }
}

/// Immutable entry in a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// 1-based step index; equals the record's position in the history.
    pub step: u32,
    /// The action as dispatched (after any sequencing override).
    pub action: ActionProposal,
    /// True when the sequencer replaced the proposer's action.
    pub overridden: bool,
    /// The proposer's action, kept only when it was overridden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed: Option<ActionProposal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<UiElement>,
    pub outcome: ExecutionOutcome,
    pub screen_before: String,
    pub screen_after: String,
    /// Subgoals first credited at this step.
    #[serde(default)]
    pub new_subgoals: Vec<String>,
    pub reward: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ActionRecord {
    /// Canonical action signature used for loop detection.
    pub fn signature(&self) -> String {
        self.action.signature()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestResult {
    #[serde(alias = "pass")]
    Pass,
    #[serde(alias = "fail")]
    Fail,
}

impl TestResult {
    pub fn as_str(self) -> &'static str {
        match self {
            TestResult::Pass => "PASS",
            TestResult::Fail => "FAIL",
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    TestPassed,
    TestAssertionFailed,
    ElementNotFound,
    ExecutionError,
    Aborted,
}

impl ResultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultKind::TestPassed => "test_passed",
            ResultKind::TestAssertionFailed => "test_assertion_failed",
            ResultKind::ElementNotFound => "element_not_found",
            ResultKind::ExecutionError => "execution_error",
            ResultKind::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final judgement of a run. Exactly one is produced per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub result: TestResult,
    pub kind: ResultKind,
    pub reasoning: String,
    /// Defect description from the final evaluator; only on failing runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bug_report: Option<String>,
}

impl Verdict {
    pub fn passed(reasoning: impl Into<String>) -> Self {
        Self {
            result: TestResult::Pass,
            kind: ResultKind::TestPassed,
            reasoning: reasoning.into(),
            bug_report: None,
        }
    }

    pub fn failed(kind: ResultKind, reasoning: impl Into<String>) -> Self {
        Self {
            result: TestResult::Fail,
            kind,
            reasoning: reasoning.into(),
            bug_report: None,
        }
    }

    pub fn execution_error(reasoning: impl Into<String>) -> Self {
        Self::failed(ResultKind::ExecutionError, reasoning)
    }

    pub fn aborted(reasoning: impl Into<String>) -> Self {
        Self::failed(ResultKind::Aborted, reasoning)
    }

    pub fn is_pass(&self) -> bool {
        self.result == TestResult::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(text: &str) -> UiElement {
        UiElement {
            text: text.to_string(),
            role: Role::Text,
            bounds: Bounds::new(0, 0, 100, 40),
            clickable: false,
        }
    }

    #[test]
    fn role_from_class_uses_short_name() {
        assert_eq!(Role::from_class("android.widget.Button"), Role::Button);
        assert_eq!(Role::from_class("android.widget.ImageButton"), Role::Button);
        assert_eq!(Role::from_class("android.widget.EditText"), Role::Input);
        assert_eq!(Role::from_class("android.widget.TextView"), Role::Text);
        assert_eq!(Role::from_class("android.view.View"), Role::Other);
    }

    #[test]
    fn bounds_center_is_midpoint() {
        let bounds = Bounds::new(100, 1960, 980, 2072);
        assert_eq!(bounds.center(), (540, 2016));
        assert_eq!(bounds.width(), 880);
        assert_eq!(bounds.height(), 112);
    }

    #[test]
    fn visible_text_skips_empty_and_normalizes() {
        let snapshot = ScreenSnapshot::new(
            vec![element("  Create   a Vault "), element(""), element("Settings")],
            "unknown",
        );
        assert_eq!(snapshot.visible_text(), "create a vault\nsettings");
    }

    #[test]
    fn verdict_serializes_with_wire_names() {
        let verdict = Verdict::failed(ResultKind::ElementNotFound, "missing");
        let json = serde_json::to_value(&verdict).expect("serialize");
        assert_eq!(json["result"], "FAIL");
        assert_eq!(json["kind"], "element_not_found");
        assert!(json.get("bug_report").is_none());
    }

    #[test]
    fn verdict_without_bug_report_still_loads() {
        let verdict: Verdict = serde_json::from_str(
            r#"{"result": "FAIL", "kind": "test_assertion_failed", "reasoning": "no note"}"#,
        )
        .expect("deserialize");
        assert_eq!(verdict.bug_report, None);
        assert!(!verdict.is_pass());
    }
}
