//! Test case definition: goal, reference plan, subgoals, and success predicates.
//!
//! Predicates here are explicit per-case configuration. Nothing is inferred
//! from the wording of the goal.

use serde::{Deserialize, Serialize};

use crate::core::action::{ActionKind, ActionProposal};
use crate::core::classifier::ScreenRule;
use crate::core::types::{ScreenSnapshot, TestResult, normalize_text};

/// A single test case as loaded from a case file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Texts used for text entry, in order. The n-th text entry of a run uses
    /// `inputs[n]`, clamped to the last entry.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(rename = "case")]
    pub meta: CaseMeta,
    #[serde(default)]
    pub config: CaseConfig,
    #[serde(default)]
    pub reference: Vec<ReferenceStep>,
    #[serde(default)]
    pub subgoals: Vec<Subgoal>,
    #[serde(default)]
    pub success: Vec<SuccessPredicate>,
    #[serde(default)]
    pub screens: Vec<ScreenRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseMeta {
    /// Unique identifier (slug format: `[a-z0-9_-]+`).
    pub id: String,
    pub name: String,
    /// Natural-language objective handed to the proposer.
    pub goal: String,
    /// Outcome the case is designed to produce.
    pub expected: TestResult,
    /// Application launched fresh before the run, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_package: Option<String>,
}

/// Per-case overrides of the runner configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popup_after_focus: Option<bool>,
}

/// One step of the known-good action sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceStep {
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ReferenceStep {
    /// Kinds must be equal; keys match when either normalized key contains the
    /// other. A reference step without a key matches any key.
    pub fn matches(&self, action: &ActionProposal) -> bool {
        if action.kind() != self.kind {
            return false;
        }
        let Some(expected) = self.key.as_deref().map(normalize_text) else {
            return true;
        };
        let Some(actual) = action.key_param().map(|k| normalize_text(&k)) else {
            return expected.is_empty();
        };
        actual.contains(&expected) || expected.contains(&actual)
    }
}

/// Named intermediate milestone. Every specified condition must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subgoal {
    pub name: String,
    /// Action kinds that can achieve this subgoal (any of).
    #[serde(default)]
    pub kinds: Vec<ActionKind>,
    /// Markers searched in the action's key parameter (any of).
    #[serde(default)]
    pub params_contain: Vec<String>,
    /// Screen type required after the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_after: Option<String>,
}

impl Subgoal {
    pub fn has_conditions(&self) -> bool {
        !self.kinds.is_empty() || !self.params_contain.is_empty() || self.screen_after.is_some()
    }

    pub fn holds(&self, action: &ActionProposal, screen_after: &str) -> bool {
        if !self.has_conditions() {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&action.kind()) {
            return false;
        }
        if !self.params_contain.is_empty() {
            let params = action
                .key_param()
                .map(|k| normalize_text(&k))
                .unwrap_or_default();
            let hit = self
                .params_contain
                .iter()
                .any(|marker| params.contains(&normalize_text(marker)));
            if !hit {
                return false;
            }
        }
        match &self.screen_after {
            Some(screen) => screen == screen_after,
            None => true,
        }
    }
}

/// Boolean condition over a snapshot that means the objective is met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessPredicate {
    TextContainsAll(Vec<String>),
    TextContainsAny(Vec<String>),
    ScreenIs(String),
}

impl SuccessPredicate {
    pub fn holds(&self, snapshot: &ScreenSnapshot) -> bool {
        match self {
            SuccessPredicate::TextContainsAll(markers) => {
                let text = snapshot.visible_text();
                !markers.is_empty()
                    && markers
                        .iter()
                        .all(|marker| text.contains(&normalize_text(marker)))
            }
            SuccessPredicate::TextContainsAny(markers) => {
                let text = snapshot.visible_text();
                markers
                    .iter()
                    .any(|marker| text.contains(&normalize_text(marker)))
            }
            SuccessPredicate::ScreenIs(screen) => snapshot.screen_type == *screen,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SuccessPredicate::TextContainsAll(markers) => {
                format!("screen shows all of [{}]", markers.join(", "))
            }
            SuccessPredicate::TextContainsAny(markers) => {
                format!("screen shows one of [{}]", markers.join(", "))
            }
            SuccessPredicate::ScreenIs(screen) => format!("screen is {screen}"),
        }
    }

    pub fn markers(&self) -> Vec<&str> {
        match self {
            SuccessPredicate::TextContainsAll(markers)
            | SuccessPredicate::TextContainsAny(markers) => {
                markers.iter().map(String::as_str).collect()
            }
            SuccessPredicate::ScreenIs(screen) => vec![screen.as_str()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Bounds, Role, UiElement};

    fn snapshot(texts: &[&str], screen: &str) -> ScreenSnapshot {
        let elements = texts
            .iter()
            .map(|t| UiElement {
                text: t.to_string(),
                role: Role::Text,
                bounds: Bounds::new(0, 0, 200, 60),
                clickable: false,
            })
            .collect();
        ScreenSnapshot::new(elements, screen)
    }

    #[test]
    fn reference_keys_match_by_substring_either_way() {
        let step = ReferenceStep {
            kind: ActionKind::TapByTarget,
            key: Some("Create a vault".to_string()),
        };
        assert!(step.matches(&ActionProposal::TapByTarget {
            text: "create a VAULT".to_string()
        }));
        assert!(step.matches(&ActionProposal::TapByTarget {
            text: "vault".to_string()
        }));
        assert!(!step.matches(&ActionProposal::TapByTarget {
            text: "Settings".to_string()
        }));
        assert!(!step.matches(&ActionProposal::EnterText {
            text: "Create a vault".to_string()
        }));
    }

    #[test]
    fn keyless_reference_matches_any_params() {
        let step = ReferenceStep {
            kind: ActionKind::Confirm,
            key: None,
        };
        assert!(step.matches(&ActionProposal::Confirm));
    }

    #[test]
    fn subgoal_requires_every_condition() {
        let subgoal = Subgoal {
            name: "enter_vault".to_string(),
            kinds: vec![ActionKind::TapByTarget],
            params_contain: vec!["use this folder".to_string()],
            screen_after: Some("inside_vault".to_string()),
        };
        let tap = ActionProposal::TapByTarget {
            text: "Use this folder".to_string(),
        };
        assert!(subgoal.holds(&tap, "inside_vault"));
        assert!(!subgoal.holds(&tap, "folder_picker"));
        assert!(!subgoal.holds(&ActionProposal::Confirm, "inside_vault"));
    }

    #[test]
    fn success_predicates_read_visible_text() {
        let snap = snapshot(&["InternVault", "Create new note"], "inside_vault");
        assert!(SuccessPredicate::TextContainsAny(vec!["create new note".to_string()]).holds(&snap));
        assert!(
            SuccessPredicate::TextContainsAll(vec!["internvault".to_string(), "note".to_string()])
                .holds(&snap)
        );
        assert!(!SuccessPredicate::TextContainsAll(vec![]).holds(&snap));
        assert!(SuccessPredicate::ScreenIs("inside_vault".to_string()).holds(&snap));
    }
}
