//! Deterministic mapping from a symbolic target to one on-screen element.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{Role, ScreenSnapshot, UiElement, normalize_text};

/// Default vertical threshold (device pixels) above which an element counts
/// as being in the lower, control-heavy region of the screen.
pub const DEFAULT_LOWER_REGION_Y: i32 = 1200;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("no element matching '{target}' on screen '{screen_type}'")]
pub struct ElementNotFound {
    pub target: String,
    pub screen_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolver {
    lower_region_y: i32,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(DEFAULT_LOWER_REGION_Y)
    }
}

impl Resolver {
    pub fn new(lower_region_y: i32) -> Self {
        Self { lower_region_y }
    }

    /// Resolve `target` against `snapshot`.
    ///
    /// Exact (case-insensitive) text matches are preferred; substring matches
    /// are only considered when no exact match exists. Multiple candidates are
    /// narrowed by the ladder button role, clickable, lower screen region, and
    /// finally snapshot order. A rung that would leave no candidates is skipped.
    /// With `prefer_interactive` off the ladder is bypassed and the first
    /// candidate wins.
    pub fn resolve<'a>(
        &self,
        target: &str,
        snapshot: &'a ScreenSnapshot,
        prefer_interactive: bool,
    ) -> Result<&'a UiElement, ElementNotFound> {
        let candidates = self.candidates(target, snapshot);
        let not_found = || ElementNotFound {
            target: target.to_string(),
            screen_type: snapshot.screen_type.clone(),
        };
        if !prefer_interactive {
            return candidates.first().copied().ok_or_else(not_found);
        }
        self.break_tie(candidates).ok_or_else(not_found)
    }

    /// Locate the text field a `focus-input` label refers to.
    ///
    /// An input whose own text (usually its hint) matches wins. Otherwise the
    /// matched label anchors the search and the nearest input at or below it
    /// is returned. With no input on screen the label itself is returned so
    /// the tap still lands where the proposer pointed.
    pub fn resolve_input<'a>(
        &self,
        label: &str,
        snapshot: &'a ScreenSnapshot,
    ) -> Result<&'a UiElement, ElementNotFound> {
        let candidates = self.candidates(label, snapshot);
        if let Some(input) = candidates.iter().find(|e| e.role == Role::Input) {
            return Ok(input);
        }
        let anchor = self.resolve(label, snapshot, false)?;
        let anchor_y = anchor.center_y();
        let below = snapshot
            .elements
            .iter()
            .filter(|e| e.role == Role::Input && e.center_y() >= anchor_y)
            .min_by_key(|e| e.center_y() - anchor_y);
        Ok(below.unwrap_or(anchor))
    }

    fn candidates<'a>(&self, target: &str, snapshot: &'a ScreenSnapshot) -> Vec<&'a UiElement> {
        let wanted = normalize_text(target);
        if wanted.is_empty() {
            return Vec::new();
        }
        let texts: Vec<(usize, String)> = snapshot
            .elements
            .iter()
            .enumerate()
            .map(|(idx, e)| (idx, normalize_text(&e.text)))
            .filter(|(_, text)| !text.is_empty())
            .collect();

        let exact: Vec<&UiElement> = texts
            .iter()
            .filter(|(_, text)| *text == wanted)
            .map(|(idx, _)| &snapshot.elements[*idx])
            .collect();
        if !exact.is_empty() {
            return exact;
        }
        texts
            .iter()
            .filter(|(_, text)| text.contains(&wanted))
            .map(|(idx, _)| &snapshot.elements[*idx])
            .collect()
    }

    fn break_tie<'a>(&self, mut candidates: Vec<&'a UiElement>) -> Option<&'a UiElement> {
        let lower = self.lower_region_y;
        let rungs: [&dyn Fn(&UiElement) -> bool; 3] = [
            &|e: &UiElement| e.role == Role::Button,
            &|e: &UiElement| e.clickable,
            &|e: &UiElement| e.center_y() > lower,
        ];
        for rung in rungs {
            if candidates.len() <= 1 {
                break;
            }
            let narrowed: Vec<&UiElement> = candidates.iter().copied().filter(|e| rung(e)).collect();
            if !narrowed.is_empty() {
                candidates = narrowed;
            }
        }
        candidates.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Bounds;

    fn el(text: &str, role: Role, clickable: bool, center_y: i32) -> UiElement {
        UiElement {
            text: text.to_string(),
            role,
            bounds: Bounds::new(100, center_y - 40, 980, center_y + 40),
            clickable,
        }
    }

    fn snap(elements: Vec<UiElement>) -> ScreenSnapshot {
        ScreenSnapshot::new(elements, "vault_configuration")
    }

    /// A label and a button share the same text; the button must win.
    #[test]
    fn prefers_button_over_label_with_same_text() {
        let snapshot = snap(vec![
            el("Confirm access", Role::Text, false, 357),
            el("Confirm access", Role::Button, true, 2016),
        ]);
        let found = Resolver::default()
            .resolve("Confirm access", &snapshot, true)
            .expect("resolve");
        assert_eq!(found.center_y(), 2016);
    }

    #[test]
    fn exact_match_beats_substring() {
        let snapshot = snap(vec![
            el("Create a vault now", Role::Button, true, 1800),
            el("create a vault", Role::Text, false, 400),
        ]);
        let found = Resolver::default()
            .resolve("Create a vault", &snapshot, true)
            .expect("resolve");
        assert_eq!(found.center_y(), 400);
    }

    #[test]
    fn falls_back_to_substring() {
        let snapshot = snap(vec![el("Use this folder", Role::Button, true, 2100)]);
        let found = Resolver::default()
            .resolve("this folder", &snapshot, true)
            .expect("resolve");
        assert_eq!(found.text, "Use this folder");
    }

    #[test]
    fn clickable_then_lower_region_narrow_ties() {
        let snapshot = snap(vec![
            el("Settings", Role::Text, false, 200),
            el("Settings", Role::Other, true, 300),
            el("Settings", Role::Other, true, 1900),
        ]);
        let found = Resolver::default()
            .resolve("settings", &snapshot, true)
            .expect("resolve");
        assert_eq!(found.center_y(), 1900);
    }

    /// Two substring matches need the ladder; both lookups land on the button.
    #[test]
    fn resolve_is_idempotent() {
        let snapshot = snap(vec![
            el("Create new note here", Role::Text, false, 600),
            el("Create new note", Role::Button, true, 1900),
            el("Vault", Role::Text, false, 200),
        ]);
        let resolver = Resolver::default();
        let index_of = |found: &UiElement| {
            snapshot
                .elements
                .iter()
                .position(|e| std::ptr::eq(e, found))
                .expect("element from snapshot")
        };
        let first = resolver
            .resolve("new note", &snapshot, true)
            .expect("first resolve");
        let second = resolver
            .resolve("new note", &snapshot, true)
            .expect("second resolve");
        assert_eq!(index_of(first), 1);
        assert_eq!(index_of(second), index_of(first));
        assert_eq!(second.bounds, first.bounds);
    }

    #[test]
    fn first_in_snapshot_order_is_the_final_fallback() {
        let snapshot = snap(vec![
            el("Note", Role::Text, false, 300),
            el("Note", Role::Text, false, 600),
        ]);
        let found = Resolver::default()
            .resolve("note", &snapshot, true)
            .expect("resolve");
        assert_eq!(found.center_y(), 300);
    }

    #[test]
    fn without_preference_first_match_wins() {
        let snapshot = snap(vec![
            el("Confirm access", Role::Text, false, 357),
            el("Confirm access", Role::Button, true, 2016),
        ]);
        let found = Resolver::default()
            .resolve("Confirm access", &snapshot, false)
            .expect("resolve");
        assert_eq!(found.center_y(), 357);
    }

    #[test]
    fn zero_matches_is_an_error() {
        let snapshot = snap(vec![el("Settings", Role::Text, false, 200)]);
        let err = Resolver::default()
            .resolve("Create a vault", &snapshot, true)
            .unwrap_err();
        assert_eq!(err.target, "Create a vault");
        assert_eq!(err.screen_type, "vault_configuration");
    }

    #[test]
    fn empty_target_never_matches() {
        let snapshot = snap(vec![el("", Role::Input, true, 500)]);
        assert!(Resolver::default().resolve("  ", &snapshot, true).is_err());
    }

    #[test]
    fn input_is_found_below_its_label() {
        let snapshot = snap(vec![
            el("Vault name", Role::Text, false, 500),
            el("", Role::Input, true, 300),
            el("My vault", Role::Input, true, 620),
        ]);
        let found = Resolver::default()
            .resolve_input("Vault name", &snapshot)
            .expect("resolve input");
        assert_eq!(found.center_y(), 620);
    }

    #[test]
    fn input_matching_its_own_hint_wins() {
        let snapshot = snap(vec![el("Untitled", Role::Input, true, 400)]);
        let found = Resolver::default()
            .resolve_input("untitled", &snapshot)
            .expect("resolve input");
        assert_eq!(found.role, Role::Input);
    }
}
