//! Rule-based screen classification over aggregated visible text.

use serde::{Deserialize, Serialize};

use crate::core::types::{ScreenSnapshot, normalize_text};

/// Label used when no rule matches.
pub const UNKNOWN_SCREEN: &str = "unknown";

/// One named screen rule. A rule matches when every `contains_all` marker is
/// present and, if `contains_any` is non-empty, at least one of those is too.
/// A rule with no markers never matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenRule {
    pub name: String,
    #[serde(default)]
    pub contains_any: Vec<String>,
    #[serde(default)]
    pub contains_all: Vec<String>,
}

impl ScreenRule {
    pub fn matches(&self, visible_text: &str) -> bool {
        if self.contains_any.is_empty() && self.contains_all.is_empty() {
            return false;
        }
        let all = self
            .contains_all
            .iter()
            .all(|marker| visible_text.contains(&normalize_text(marker)));
        let any = self.contains_any.is_empty()
            || self
                .contains_any
                .iter()
                .any(|marker| visible_text.contains(&normalize_text(marker)));
        all && any
    }
}

/// First matching rule wins; rules are evaluated in declaration order.
pub fn classify(rules: &[ScreenRule], snapshot: &ScreenSnapshot) -> String {
    let text = snapshot.visible_text();
    rules
        .iter()
        .find(|rule| rule.matches(&text))
        .map(|rule| rule.name.clone())
        .unwrap_or_else(|| UNKNOWN_SCREEN.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Bounds, Role, UiElement};

    fn texts(values: &[&str]) -> ScreenSnapshot {
        let elements = values
            .iter()
            .map(|t| UiElement {
                text: t.to_string(),
                role: Role::Text,
                bounds: Bounds::new(0, 0, 100, 100),
                clickable: false,
            })
            .collect();
        ScreenSnapshot::new(elements, UNKNOWN_SCREEN)
    }

    fn rule(name: &str, any: &[&str], all: &[&str]) -> ScreenRule {
        ScreenRule {
            name: name.to_string(),
            contains_any: any.iter().map(|s| s.to_string()).collect(),
            contains_all: all.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            rule("sync_setup", &["sign in", "obsidian sync"], &[]),
            rule("initial_vault_choice", &["create a vault"], &[]),
        ];
        let screen = texts(&["Create a vault", "Use my existing vault"]);
        assert_eq!(classify(&rules, &screen), "initial_vault_choice");
    }

    #[test]
    fn contains_all_requires_every_marker() {
        let rules = vec![rule("vault_configuration", &[], &["vault name", "create"])];
        assert_eq!(classify(&rules, &texts(&["Vault name"])), UNKNOWN_SCREEN);
        assert_eq!(
            classify(&rules, &texts(&["Vault name", "Create a vault"])),
            "vault_configuration"
        );
    }

    #[test]
    fn markers_match_normalized_text() {
        let rules = vec![rule("inside_vault", &["Create  New NOTE"], &[])];
        assert_eq!(
            classify(&rules, &texts(&["  create new   note "])),
            "inside_vault"
        );
    }

    #[test]
    fn empty_rule_never_matches() {
        let rules = vec![rule("anything", &[], &[])];
        assert_eq!(classify(&rules, &texts(&["x"])), UNKNOWN_SCREEN);
    }
}
