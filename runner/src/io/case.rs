//! Case file parsing and validation.
//!
//! Cases are TOML files describing one test: goal, inputs, reference plan,
//! subgoals, success predicates, and screen rules. See `eval/cases/` for
//! examples.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::core::test_spec::{SuccessPredicate, TestSpec};

/// Load and validate a case file from the given path.
pub fn load_case(path: &Path) -> Result<TestSpec> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read case {}", path.display()))?;
    let spec = parse_case(&contents).with_context(|| format!("load case {}", path.display()))?;
    debug!(id = %spec.meta.id, path = %path.display(), "case loaded");
    Ok(spec)
}

/// Parse and validate case TOML.
pub fn parse_case(contents: &str) -> Result<TestSpec> {
    let spec: TestSpec = toml::from_str(contents).context("parse case")?;
    validate_case(&spec)?;
    Ok(spec)
}

pub fn validate_case(spec: &TestSpec) -> Result<()> {
    validate_case_id(&spec.meta.id)?;
    if spec.meta.name.trim().is_empty() {
        bail!("case.name must be non-empty");
    }
    if spec.meta.goal.trim().is_empty() {
        bail!("case.goal must be non-empty");
    }
    if let Some(package) = &spec.meta.app_package
        && package.trim().is_empty()
    {
        bail!("case.app_package must be non-empty when set");
    }
    if spec.inputs.iter().any(|input| input.is_empty()) {
        bail!("inputs must not contain empty strings");
    }
    if let Some(max_steps) = spec.config.max_steps
        && max_steps == 0
    {
        bail!("config.max_steps must be > 0");
    }
    for (index, step) in spec.reference.iter().enumerate() {
        if step.kind.is_terminal() {
            bail!("reference[{index}] must be a device action, not {}", step.kind);
        }
        if let Some(key) = &step.key
            && key.trim().is_empty()
        {
            bail!("reference[{index}].key must be non-empty when set");
        }
    }

    let mut names = BTreeSet::new();
    for (index, subgoal) in spec.subgoals.iter().enumerate() {
        if subgoal.name.trim().is_empty() {
            bail!("subgoals[{index}].name must be non-empty");
        }
        if !names.insert(subgoal.name.as_str()) {
            bail!("duplicate subgoal name {}", subgoal.name);
        }
        if !subgoal.has_conditions() {
            bail!("subgoal {} needs at least one of kinds, params_contain, screen_after", subgoal.name);
        }
        if subgoal.params_contain.iter().any(|m| m.trim().is_empty()) {
            bail!("subgoal {} has an empty params_contain marker", subgoal.name);
        }
    }

    for (index, predicate) in spec.success.iter().enumerate() {
        let markers = predicate.markers();
        if markers.is_empty() || markers.iter().any(|m| m.trim().is_empty()) {
            bail!("success[{index}] needs non-empty markers");
        }
        if let SuccessPredicate::ScreenIs(screen) = predicate
            && !spec.screens.iter().any(|rule| rule.name == *screen)
        {
            bail!("success[{index}] names screen {screen} which no [[screens]] rule defines");
        }
    }

    let mut screens = BTreeSet::new();
    for (index, rule) in spec.screens.iter().enumerate() {
        if rule.name.trim().is_empty() {
            bail!("screens[{index}].name must be non-empty");
        }
        if !screens.insert(rule.name.as_str()) {
            bail!("duplicate screen rule {}", rule.name);
        }
        if rule.contains_any.is_empty() && rule.contains_all.is_empty() {
            bail!("screen rule {} needs contains_any or contains_all", rule.name);
        }
        if rule
            .contains_any
            .iter()
            .chain(rule.contains_all.iter())
            .any(|m| m.trim().is_empty())
        {
            bail!("screen rule {} has an empty marker", rule.name);
        }
    }
    Ok(())
}

/// Discover and load all case files from a directory.
///
/// Returns cases sorted by id. Errors if duplicate ids are found.
pub fn discover_cases(dir: &Path) -> Result<Vec<TestSpec>> {
    Ok(discover_case_files(dir)?
        .into_iter()
        .map(|(_, spec)| spec)
        .collect())
}

/// Like [`discover_cases`], keeping the path each case was loaded from.
pub fn discover_case_files(dir: &Path) -> Result<Vec<(PathBuf, TestSpec)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut cases = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read cases dir {}", dir.display()))? {
        let entry = entry.context("read case entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        let spec = load_case(&path)?;
        cases.push((path, spec));
    }
    cases.sort_by(|(_, left), (_, right)| left.meta.id.cmp(&right.meta.id));
    for pair in cases.windows(2) {
        if pair[0].1.meta.id == pair[1].1.meta.id {
            return Err(anyhow!("duplicate case.id {}", pair[0].1.meta.id));
        }
    }
    Ok(cases)
}

fn validate_case_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("case.id must be non-empty");
    }
    if id.contains("..") {
        bail!("case.id must not contain '..'");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("case.id must use [a-z0-9_-] only");
    }
    Ok(())
}
