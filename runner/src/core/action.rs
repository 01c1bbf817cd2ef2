//! Closed action vocabulary and strict proposal parsing.
//!
//! Proposers hand back loosely structured JSON (`RawProposal`). Parsing turns
//! it into a typed [`ActionProposal`] or rejects it; unknown kinds and missing
//! parameters are never coerced into some other action.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::types::{TestResult, normalize_text};

/// Longest wait a proposer may request, in seconds.
pub const MAX_WAIT_SECS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    FocusInput,
    EnterText,
    ClearAndEnterText,
    Confirm,
    TapByTarget,
    TapByCoordinate,
    Scroll,
    Wait,
    NavigateBack,
    DeclareDone,
    DeclareFailed,
}

impl ActionKind {
    pub const ALL: [ActionKind; 11] = [
        ActionKind::FocusInput,
        ActionKind::EnterText,
        ActionKind::ClearAndEnterText,
        ActionKind::Confirm,
        ActionKind::TapByTarget,
        ActionKind::TapByCoordinate,
        ActionKind::Scroll,
        ActionKind::Wait,
        ActionKind::NavigateBack,
        ActionKind::DeclareDone,
        ActionKind::DeclareFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::FocusInput => "focus-input",
            ActionKind::EnterText => "enter-text",
            ActionKind::ClearAndEnterText => "clear-and-enter-text",
            ActionKind::Confirm => "confirm",
            ActionKind::TapByTarget => "tap-by-target",
            ActionKind::TapByCoordinate => "tap-by-coordinate",
            ActionKind::Scroll => "scroll",
            ActionKind::Wait => "wait",
            ActionKind::NavigateBack => "navigate-back",
            ActionKind::DeclareDone => "declare-done",
            ActionKind::DeclareFailed => "declare-failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = raw.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
    }

    pub fn is_text_entry(self) -> bool {
        matches!(self, ActionKind::EnterText | ActionKind::ClearAndEnterText)
    }

    /// Declarations end the run and never reach the device.
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionKind::DeclareDone | ActionKind::DeclareFailed)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `focus-input` names its field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Locator {
    Point { x: i32, y: i32 },
    Label { label: String },
}

impl Locator {
    pub fn label(text: impl Into<String>) -> Self {
        Locator::Label { label: text.into() }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Point { x, y } => write!(f, "({x},{y})"),
            Locator::Label { label } => write!(f, "'{label}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "up" => Some(ScrollDirection::Up),
            "down" => Some(ScrollDirection::Down),
            "left" => Some(ScrollDirection::Left),
            "right" => Some(ScrollDirection::Right),
            _ => None,
        }
    }
}

/// A validated action drawn from the closed vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "kebab-case")]
pub enum ActionProposal {
    FocusInput { target: Locator },
    EnterText { text: String },
    ClearAndEnterText { text: String },
    Confirm,
    TapByTarget { text: String },
    TapByCoordinate { x: i32, y: i32 },
    Scroll { direction: ScrollDirection },
    Wait { seconds: f64 },
    NavigateBack,
    DeclareDone { result: TestResult, reason: String },
    DeclareFailed { reason: String },
}

impl ActionProposal {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionProposal::FocusInput { .. } => ActionKind::FocusInput,
            ActionProposal::EnterText { .. } => ActionKind::EnterText,
            ActionProposal::ClearAndEnterText { .. } => ActionKind::ClearAndEnterText,
            ActionProposal::Confirm => ActionKind::Confirm,
            ActionProposal::TapByTarget { .. } => ActionKind::TapByTarget,
            ActionProposal::TapByCoordinate { .. } => ActionKind::TapByCoordinate,
            ActionProposal::Scroll { .. } => ActionKind::Scroll,
            ActionProposal::Wait { .. } => ActionKind::Wait,
            ActionProposal::NavigateBack => ActionKind::NavigateBack,
            ActionProposal::DeclareDone { .. } => ActionKind::DeclareDone,
            ActionProposal::DeclareFailed { .. } => ActionKind::DeclareFailed,
        }
    }

    /// The parameter that identifies what the action acts on, if any.
    ///
    /// Used by plan-adherence matching and subgoal predicates.
    pub fn key_param(&self) -> Option<String> {
        match self {
            ActionProposal::FocusInput {
                target: Locator::Label { label },
            } => Some(label.clone()),
            ActionProposal::FocusInput {
                target: Locator::Point { x, y },
            }
            | ActionProposal::TapByCoordinate { x, y } => Some(format!("{x},{y}")),
            ActionProposal::EnterText { text }
            | ActionProposal::ClearAndEnterText { text }
            | ActionProposal::TapByTarget { text } => Some(text.clone()),
            ActionProposal::Scroll { direction } => Some(direction.as_str().to_string()),
            ActionProposal::Wait { seconds } => Some(format!("{seconds}")),
            ActionProposal::DeclareDone { result, .. } => Some(result.as_str().to_string()),
            ActionProposal::DeclareFailed { reason } => Some(reason.clone()),
            ActionProposal::Confirm | ActionProposal::NavigateBack => None,
        }
    }

    /// Canonical `kind(key)` string: identical actions always produce identical
    /// signatures regardless of case or whitespace in their parameters.
    pub fn signature(&self) -> String {
        match self.key_param() {
            Some(key) => format!("{}({})", self.kind(), normalize_text(&key)),
            None => self.kind().to_string(),
        }
    }
}

impl fmt::Display for ActionProposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key_param() {
            Some(key) => write!(f, "{}({key})", self.kind()),
            None => write!(f, "{}", self.kind()),
        }
    }
}

/// Proposer output before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawProposal {
    pub kind: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl RawProposal {
    pub fn new(kind: &str, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: kind.to_string(),
            params,
            reasoning: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedProposal {
    #[error("unknown action kind '{0}'")]
    UnknownKind(String),
    #[error("{kind} requires parameter '{param}'")]
    MissingParam {
        kind: ActionKind,
        param: &'static str,
    },
    #[error("{kind} parameter '{param}' is invalid: {detail}")]
    InvalidParam {
        kind: ActionKind,
        param: &'static str,
        detail: String,
    },
}

/// Validate a raw proposal against the action vocabulary.
pub fn parse_proposal(raw: &RawProposal) -> Result<ActionProposal, MalformedProposal> {
    let kind =
        ActionKind::parse(&raw.kind).ok_or_else(|| MalformedProposal::UnknownKind(raw.kind.clone()))?;
    let params = Params {
        kind,
        map: &raw.params,
    };
    let proposal = match kind {
        ActionKind::FocusInput => {
            if params.map.contains_key("label") {
                ActionProposal::FocusInput {
                    target: Locator::Label {
                        label: params.text("label")?,
                    },
                }
            } else if params.map.contains_key("x") || params.map.contains_key("y") {
                ActionProposal::FocusInput {
                    target: Locator::Point {
                        x: params.coordinate("x")?,
                        y: params.coordinate("y")?,
                    },
                }
            } else {
                return Err(MalformedProposal::MissingParam {
                    kind,
                    param: "label",
                });
            }
        }
        ActionKind::EnterText => ActionProposal::EnterText {
            text: params.text("text")?,
        },
        ActionKind::ClearAndEnterText => ActionProposal::ClearAndEnterText {
            text: params.text("text")?,
        },
        ActionKind::Confirm => ActionProposal::Confirm,
        ActionKind::TapByTarget => ActionProposal::TapByTarget {
            text: params.text("text")?,
        },
        ActionKind::TapByCoordinate => ActionProposal::TapByCoordinate {
            x: params.coordinate("x")?,
            y: params.coordinate("y")?,
        },
        ActionKind::Scroll => {
            let raw_direction = params.text("direction")?;
            let direction = ScrollDirection::parse(&raw_direction).ok_or_else(|| {
                MalformedProposal::InvalidParam {
                    kind,
                    param: "direction",
                    detail: format!("expected up/down/left/right, got '{raw_direction}'"),
                }
            })?;
            ActionProposal::Scroll { direction }
        }
        ActionKind::Wait => ActionProposal::Wait {
            seconds: params.seconds("seconds")?,
        },
        ActionKind::NavigateBack => ActionProposal::NavigateBack,
        ActionKind::DeclareDone => {
            let raw_result = params.text("result")?;
            let result = match raw_result.to_ascii_uppercase().as_str() {
                "PASS" => TestResult::Pass,
                "FAIL" => TestResult::Fail,
                _ => {
                    return Err(MalformedProposal::InvalidParam {
                        kind,
                        param: "result",
                        detail: format!("expected PASS or FAIL, got '{raw_result}'"),
                    });
                }
            };
            ActionProposal::DeclareDone {
                result,
                reason: params.optional_text("reason"),
            }
        }
        ActionKind::DeclareFailed => ActionProposal::DeclareFailed {
            reason: params.text("reason")?,
        },
    };
    Ok(proposal)
}

struct Params<'a> {
    kind: ActionKind,
    map: &'a Map<String, Value>,
}

impl Params<'_> {
    fn get(&self, param: &'static str) -> Result<&Value, MalformedProposal> {
        match self.map.get(param) {
            Some(Value::Null) | None => Err(MalformedProposal::MissingParam {
                kind: self.kind,
                param,
            }),
            Some(value) => Ok(value),
        }
    }

    fn invalid(&self, param: &'static str, detail: impl Into<String>) -> MalformedProposal {
        MalformedProposal::InvalidParam {
            kind: self.kind,
            param,
            detail: detail.into(),
        }
    }

    fn text(&self, param: &'static str) -> Result<String, MalformedProposal> {
        match self.get(param)? {
            Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Value::String(_) => Err(self.invalid(param, "must not be empty")),
            other => Err(self.invalid(param, format!("expected string, got {other}"))),
        }
    }

    fn optional_text(&self, param: &'static str) -> String {
        self.map
            .get(param)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    fn coordinate(&self, param: &'static str) -> Result<i32, MalformedProposal> {
        let value = self.get(param)?;
        let number = value
            .as_i64()
            .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| self.invalid(param, format!("expected integer, got {value}")))?;
        i32::try_from(number)
            .ok()
            .filter(|n| *n >= 0)
            .ok_or_else(|| self.invalid(param, format!("{number} is not an on-screen pixel")))
    }

    fn seconds(&self, param: &'static str) -> Result<f64, MalformedProposal> {
        let value = self.get(param)?;
        let seconds = value
            .as_f64()
            .ok_or_else(|| self.invalid(param, format!("expected number, got {value}")))?;
        if !(0.0..=MAX_WAIT_SECS).contains(&seconds) {
            return Err(self.invalid(param, format!("must be within 0..={MAX_WAIT_SECS}")));
        }
        Ok(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_every_kind_in_vocabulary() {
        let cases = [
            ("focus-input", json!({"label": "Vault name"})),
            ("enter-text", json!({"text": "InternVault"})),
            ("clear-and-enter-text", json!({"text": "x"})),
            ("confirm", json!({})),
            ("tap-by-target", json!({"text": "Create a vault"})),
            ("tap-by-coordinate", json!({"x": 540, "y": 400})),
            ("scroll", json!({"direction": "down"})),
            ("wait", json!({"seconds": 2})),
            ("navigate-back", json!({})),
            ("declare-done", json!({"result": "PASS", "reason": "ok"})),
            ("declare-failed", json!({"reason": "no button"})),
        ];
        for (kind, params) in cases {
            let parsed = parse_proposal(&RawProposal::new(kind, params)).expect(kind);
            assert_eq!(parsed.kind().as_str(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected_not_coerced() {
        let err = parse_proposal(&RawProposal::new("swipe", json!({}))).unwrap_err();
        assert_eq!(err, MalformedProposal::UnknownKind("swipe".to_string()));
    }

    #[test]
    fn missing_required_param_is_rejected() {
        let err = parse_proposal(&RawProposal::new("tap-by-target", json!({}))).unwrap_err();
        assert_eq!(
            err,
            MalformedProposal::MissingParam {
                kind: ActionKind::TapByTarget,
                param: "text"
            }
        );
    }

    #[test]
    fn focus_input_accepts_label_or_point() {
        let by_point =
            parse_proposal(&RawProposal::new("focus-input", json!({"x": 10, "y": 20}))).expect("point");
        assert_eq!(
            by_point,
            ActionProposal::FocusInput {
                target: Locator::Point { x: 10, y: 20 }
            }
        );
        let err = parse_proposal(&RawProposal::new("focus-input", json!({"x": 10}))).unwrap_err();
        assert!(matches!(err, MalformedProposal::MissingParam { param: "y", .. }));
    }

    #[test]
    fn negative_coordinates_are_invalid() {
        let err = parse_proposal(&RawProposal::new("tap-by-coordinate", json!({"x": -1, "y": 5})))
            .unwrap_err();
        assert!(matches!(err, MalformedProposal::InvalidParam { param: "x", .. }));
    }

    #[test]
    fn wait_is_bounded() {
        let err = parse_proposal(&RawProposal::new("wait", json!({"seconds": 600}))).unwrap_err();
        assert!(matches!(err, MalformedProposal::InvalidParam { param: "seconds", .. }));
    }

    #[test]
    fn signature_ignores_case_and_whitespace() {
        let a = ActionProposal::TapByTarget {
            text: "Create  a Vault".to_string(),
        };
        let b = ActionProposal::TapByTarget {
            text: "create a vault".to_string(),
        };
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature(), "tap-by-target(create a vault)");
        assert_eq!(ActionProposal::Confirm.signature(), "confirm");
    }

    #[test]
    fn proposal_serializes_as_kind_and_params() {
        let action = ActionProposal::TapByCoordinate { x: 540, y: 400 };
        let json = serde_json::to_value(&action).expect("serialize");
        assert_eq!(json, json!({"kind": "tap-by-coordinate", "params": {"x": 540, "y": 400}}));
        let back: ActionProposal = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, action);
    }
}
