//! Action sequencing state machine.
//!
//! After an input is focused the machine owes a text entry, and after a text
//! entry it owes a confirmation. Any other proposal made while an action is
//! owed is replaced by the owed action. With the popup quirk enabled, a focus
//! first owes a back navigation and a re-focus of the same field.
//!
//! Selection and transition are split: [`Sequencer::select`] decides what to
//! dispatch, [`Sequencer::locate`] resolves its target against the current
//! screen, and [`Sequencer::advance`] is applied only after the device
//! reports success.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::action::{ActionKind, ActionProposal, Locator};
use crate::core::resolver::{ElementNotFound, Resolver};
use crate::core::test_spec::TestSpec;
use crate::core::types::{Role, ScreenSnapshot, UiElement};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SequencerState {
    #[default]
    Free,
    AwaitingPopupDismissal {
        refocus: Locator,
    },
    AwaitingRefocus {
        refocus: Locator,
    },
    AwaitingTextEntry,
    AwaitingConfirmation,
}

impl SequencerState {
    pub fn name(&self) -> &'static str {
        match self {
            SequencerState::Free => "free",
            SequencerState::AwaitingPopupDismissal { .. } => "awaiting_popup_dismissal",
            SequencerState::AwaitingRefocus { .. } => "awaiting_refocus",
            SequencerState::AwaitingTextEntry => "awaiting_text_entry",
            SequencerState::AwaitingConfirmation => "awaiting_confirmation",
        }
    }
}

/// A proposal replaced because a different action was owed. Corrective, not
/// a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceViolation {
    pub state: &'static str,
    pub proposed: ActionKind,
    pub owed: ActionKind,
}

impl fmt::Display for SequenceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} proposed while {}; {} owed",
            self.proposed, self.state, self.owed
        )
    }
}

/// The action chosen for this step.
#[derive(Debug, Clone, PartialEq)]
pub struct Selected {
    pub action: ActionProposal,
    /// The proposer's action when it was replaced.
    pub replaced: Option<ActionProposal>,
    /// Whether the action discharges an owed obligation.
    pub mandatory: bool,
}

impl Selected {
    pub fn overridden(&self) -> bool {
        self.replaced.is_some()
    }

    pub fn violation(&self, state: &SequencerState) -> Option<SequenceViolation> {
        self.replaced.as_ref().map(|proposed| SequenceViolation {
            state: state.name(),
            proposed: proposed.kind(),
            owed: self.action.kind(),
        })
    }
}

/// Where the selected action lands on the current screen.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Located {
    pub element: Option<UiElement>,
    /// The action puts keyboard focus into a text field.
    pub focuses_input: bool,
}

#[derive(Debug, Clone)]
pub struct Sequencer {
    resolver: Resolver,
    popup_after_focus: bool,
    inputs: Vec<String>,
}

impl Sequencer {
    pub fn new(resolver: Resolver, popup_after_focus: bool, spec: &TestSpec) -> Self {
        Self {
            resolver,
            popup_after_focus,
            inputs: spec.inputs.clone(),
        }
    }

    /// Decide which action to dispatch given the owed state.
    ///
    /// `text_entries` is the number of text entries already executed in the
    /// run and picks which configured input a synthesized entry carries. When
    /// a text entry is owed but no input text is configured the proposal
    /// passes through unchanged.
    pub fn select(
        &self,
        state: &SequencerState,
        text_entries: usize,
        proposal: ActionProposal,
    ) -> Selected {
        let kind = proposal.kind();
        let owed = match state {
            SequencerState::Free => None,
            SequencerState::AwaitingPopupDismissal { .. } => {
                (kind != ActionKind::NavigateBack).then_some(ActionProposal::NavigateBack)
            }
            SequencerState::AwaitingRefocus { refocus } => {
                let owed = ActionProposal::FocusInput {
                    target: refocus.clone(),
                };
                (proposal != owed).then_some(owed)
            }
            SequencerState::AwaitingTextEntry => {
                if kind.is_text_entry() {
                    None
                } else {
                    self.input_text(text_entries)
                        .map(|text| ActionProposal::EnterText { text })
                }
            }
            SequencerState::AwaitingConfirmation => {
                (kind != ActionKind::Confirm).then_some(ActionProposal::Confirm)
            }
        };
        let mandatory = match state {
            SequencerState::Free => false,
            SequencerState::AwaitingTextEntry => owed.is_some() || kind.is_text_entry(),
            _ => true,
        };
        match owed {
            Some(action) => Selected {
                action,
                replaced: Some(proposal),
                mandatory,
            },
            None => Selected {
                action: proposal,
                replaced: None,
                mandatory,
            },
        }
    }

    /// Resolve the selected action's target on `snapshot`.
    pub fn locate(
        &self,
        selected: &Selected,
        snapshot: &ScreenSnapshot,
    ) -> Result<Located, ElementNotFound> {
        match &selected.action {
            ActionProposal::TapByTarget { text } => {
                let element = self.resolver.resolve(text, snapshot, true)?;
                Ok(Located {
                    focuses_input: element.role == Role::Input,
                    element: Some(element.clone()),
                })
            }
            ActionProposal::FocusInput {
                target: Locator::Label { label },
            } => {
                let element = self.resolver.resolve_input(label, snapshot)?;
                Ok(Located {
                    element: Some(element.clone()),
                    focuses_input: true,
                })
            }
            ActionProposal::FocusInput {
                target: Locator::Point { .. },
            } => Ok(Located {
                element: None,
                focuses_input: true,
            }),
            _ => Ok(Located::default()),
        }
    }

    /// State after `selected` executed successfully from `state`.
    pub fn advance(
        &self,
        state: &SequencerState,
        selected: &Selected,
        located: &Located,
    ) -> SequencerState {
        if located.focuses_input {
            let refocusing = matches!(state, SequencerState::AwaitingRefocus { .. });
            if self.popup_after_focus && !refocusing {
                return SequencerState::AwaitingPopupDismissal {
                    refocus: refocus_locator(&selected.action),
                };
            }
            return SequencerState::AwaitingTextEntry;
        }
        match (state, selected.action.kind()) {
            (SequencerState::AwaitingPopupDismissal { refocus }, ActionKind::NavigateBack) => {
                SequencerState::AwaitingRefocus {
                    refocus: refocus.clone(),
                }
            }
            (_, kind) if kind.is_text_entry() => SequencerState::AwaitingConfirmation,
            _ => SequencerState::Free,
        }
    }

    fn input_text(&self, text_entries: usize) -> Option<String> {
        self.inputs
            .get(text_entries)
            .or_else(|| self.inputs.last())
            .cloned()
    }
}

fn refocus_locator(action: &ActionProposal) -> Locator {
    match action {
        ActionProposal::FocusInput { target } => target.clone(),
        ActionProposal::TapByTarget { text } => Locator::label(text.clone()),
        other => Locator::label(other.key_param().unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_spec::CaseMeta;
    use crate::core::types::{Bounds, TestResult};

    fn spec(inputs: &[&str]) -> TestSpec {
        TestSpec {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            meta: CaseMeta {
                id: "create-vault".to_string(),
                name: "Create Vault".to_string(),
                goal: "Create a vault".to_string(),
                expected: TestResult::Pass,
                app_package: None,
            },
            config: Default::default(),
            reference: Vec::new(),
            subgoals: Vec::new(),
            success: Vec::new(),
            screens: Vec::new(),
        }
    }

    fn sequencer(popup: bool, inputs: &[&str]) -> Sequencer {
        Sequencer::new(Resolver::default(), popup, &spec(inputs))
    }

    fn snapshot() -> ScreenSnapshot {
        ScreenSnapshot::new(
            vec![
                UiElement {
                    text: "Vault name".to_string(),
                    role: Role::Text,
                    bounds: Bounds::new(0, 400, 600, 460),
                    clickable: false,
                },
                UiElement {
                    text: "My vault".to_string(),
                    role: Role::Input,
                    bounds: Bounds::new(0, 480, 1000, 560),
                    clickable: true,
                },
            ],
            "vault_configuration",
        )
    }

    fn step(
        seq: &Sequencer,
        state: &SequencerState,
        entries: usize,
        proposal: ActionProposal,
    ) -> (Selected, SequencerState) {
        let selected = seq.select(state, entries, proposal);
        let located = seq.locate(&selected, &snapshot()).expect("locate");
        let next = seq.advance(state, &selected, &located);
        (selected, next)
    }

    fn focus() -> ActionProposal {
        ActionProposal::FocusInput {
            target: Locator::label("Vault name"),
        }
    }

    /// Focus, then an unrelated tap: the tap is replaced by the configured text.
    #[test]
    fn replaces_non_text_proposal_while_text_entry_owed() {
        let seq = sequencer(false, &["InternVault"]);
        let (_, state) = step(&seq, &SequencerState::Free, 0, focus());
        assert_eq!(state, SequencerState::AwaitingTextEntry);

        let tap = ActionProposal::TapByTarget {
            text: "Vault name".to_string(),
        };
        let (selected, state) = step(&seq, &state, 0, tap.clone());
        assert_eq!(
            selected.action,
            ActionProposal::EnterText {
                text: "InternVault".to_string()
            }
        );
        assert_eq!(selected.replaced, Some(tap));
        assert!(selected.mandatory);
        assert_eq!(state, SequencerState::AwaitingConfirmation);

        let (selected, state) = step(&seq, &state, 1, ActionProposal::NavigateBack);
        assert_eq!(selected.action, ActionProposal::Confirm);
        assert!(selected.overridden());
        assert_eq!(state, SequencerState::Free);
    }

    #[test]
    fn proposer_text_entry_is_kept_when_owed() {
        let seq = sequencer(false, &["InternVault"]);
        let typed = ActionProposal::EnterText {
            text: "Other".to_string(),
        };
        let selected = seq.select(&SequencerState::AwaitingTextEntry, 0, typed.clone());
        assert_eq!(selected.action, typed);
        assert!(!selected.overridden());
        assert!(selected.mandatory);
    }

    #[test]
    fn free_state_passes_proposals_through() {
        let seq = sequencer(false, &["InternVault"]);
        let selected = seq.select(&SequencerState::Free, 0, ActionProposal::NavigateBack);
        assert_eq!(selected.action, ActionProposal::NavigateBack);
        assert!(!selected.mandatory);
        assert!(selected.violation(&SequencerState::Free).is_none());
    }

    #[test]
    fn without_inputs_text_entry_is_not_synthesized() {
        let seq = sequencer(false, &[]);
        let selected = seq.select(&SequencerState::AwaitingTextEntry, 0, ActionProposal::Confirm);
        assert_eq!(selected.action, ActionProposal::Confirm);
        assert!(!selected.mandatory);
        let located = seq.locate(&selected, &snapshot()).expect("locate");
        let next = seq.advance(&SequencerState::AwaitingTextEntry, &selected, &located);
        assert_eq!(next, SequencerState::Free);
    }

    #[test]
    fn synthesized_text_uses_next_input_then_clamps() {
        let seq = sequencer(false, &["Meeting Notes", "Daily Standup"]);
        let pick = |entries| match seq
            .select(&SequencerState::AwaitingTextEntry, entries, ActionProposal::Confirm)
            .action
        {
            ActionProposal::EnterText { text } => text,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(pick(0), "Meeting Notes");
        assert_eq!(pick(1), "Daily Standup");
        assert_eq!(pick(5), "Daily Standup");
    }

    #[test]
    fn tap_on_input_counts_as_focus() {
        let seq = sequencer(false, &["x"]);
        let (_, state) = step(
            &seq,
            &SequencerState::Free,
            0,
            ActionProposal::TapByTarget {
                text: "My vault".to_string(),
            },
        );
        assert_eq!(state, SequencerState::AwaitingTextEntry);
    }

    #[test]
    fn popup_quirk_forces_back_then_refocus() {
        let seq = sequencer(true, &["InternVault"]);
        let (_, state) = step(&seq, &SequencerState::Free, 0, focus());
        assert_eq!(
            state,
            SequencerState::AwaitingPopupDismissal {
                refocus: Locator::label("Vault name")
            }
        );

        let (selected, state) = step(&seq, &state, 0, ActionProposal::Confirm);
        assert_eq!(selected.action, ActionProposal::NavigateBack);
        assert_eq!(
            state,
            SequencerState::AwaitingRefocus {
                refocus: Locator::label("Vault name")
            }
        );

        let (selected, state) = step(&seq, &state, 0, ActionProposal::Confirm);
        assert_eq!(selected.action, focus());
        assert_eq!(state, SequencerState::AwaitingTextEntry);
    }

    #[test]
    fn refocus_lands_on_the_stored_field() {
        let seq = sequencer(true, &["InternVault"]);
        let state = SequencerState::AwaitingRefocus {
            refocus: Locator::label("Vault name"),
        };
        let elsewhere = ActionProposal::FocusInput {
            target: Locator::Point { x: 10, y: 10 },
        };
        let (selected, next) = step(&seq, &state, 0, elsewhere.clone());
        assert_eq!(selected.action, focus());
        assert_eq!(selected.replaced, Some(elsewhere));
        assert!(selected.mandatory);
        assert_eq!(next, SequencerState::AwaitingTextEntry);

        let (selected, _) = step(&seq, &state, 0, focus());
        assert!(!selected.overridden());
    }

    #[test]
    fn violation_describes_the_replacement() {
        let seq = sequencer(false, &["x"]);
        let state = SequencerState::AwaitingConfirmation;
        let selected = seq.select(&state, 1, ActionProposal::NavigateBack);
        let violation = selected.violation(&state).expect("violation");
        assert_eq!(violation.proposed, ActionKind::NavigateBack);
        assert_eq!(violation.owed, ActionKind::Confirm);
        assert_eq!(
            violation.to_string(),
            "navigate-back proposed while awaiting_confirmation; confirm owed"
        );
    }
}
