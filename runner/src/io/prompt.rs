//! Prompt rendering for the command proposer and evaluator.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::action::ActionKind;
use crate::core::types::{ActionRecord, UiElement};
use crate::io::evaluator::EvaluationRequest;
use crate::io::proposer::ProposalRequest;

const PROPOSER_TEMPLATE: &str = include_str!("prompts/proposer.md");
const EVALUATOR_TEMPLATE: &str = include_str!("prompts/evaluator.md");

#[derive(Debug, Clone, Serialize)]
struct ElementContext<'a> {
    text: &'a str,
    role: &'static str,
    clickable: bool,
    x: i32,
    y: i32,
}

#[derive(Debug, Clone, Serialize)]
struct StepContext {
    step: u32,
    action: String,
    success: bool,
    message: String,
    overridden: bool,
    proposed: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ActionHelp {
    kind: &'static str,
    params: &'static str,
}

fn params_help(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::FocusInput => r#"{"label": "<field label>"} or {"x": 0, "y": 0}"#,
        ActionKind::EnterText | ActionKind::ClearAndEnterText => r#"{"text": "<text>"}"#,
        ActionKind::TapByTarget => r#"{"text": "<visible text>"}"#,
        ActionKind::TapByCoordinate => r#"{"x": 0, "y": 0}"#,
        ActionKind::Scroll => r#"{"direction": "up|down|left|right"}"#,
        ActionKind::Wait => r#"{"seconds": 1}"#,
        ActionKind::DeclareDone => r#"{"result": "PASS|FAIL", "reason": "<why>"}"#,
        ActionKind::DeclareFailed => r#"{"reason": "<why>"}"#,
        ActionKind::Confirm | ActionKind::NavigateBack => "{}",
    }
}

fn element_context(elements: &[UiElement]) -> Vec<ElementContext<'_>> {
    elements
        .iter()
        .filter(|e| !e.text.trim().is_empty() || e.is_interactive())
        .map(|e| {
            let (x, y) = e.center();
            ElementContext {
                text: e.text.trim(),
                role: e.role.as_str(),
                clickable: e.clickable,
                x,
                y,
            }
        })
        .collect()
}

fn step_context(records: &[ActionRecord]) -> Vec<StepContext> {
    records
        .iter()
        .map(|record| StepContext {
            step: record.step,
            action: record.action.to_string(),
            success: record.outcome.success,
            message: record.outcome.message.clone(),
            overridden: record.overridden,
            proposed: record.proposed.as_ref().map(ToString::to_string),
        })
        .collect()
}

/// Renders proposer and evaluator prompts from the embedded templates.
pub struct PromptBuilder {
    env: Environment<'static>,
    history_window: usize,
}

impl PromptBuilder {
    pub fn new(history_window: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("proposer", PROPOSER_TEMPLATE)
            .expect("proposer template should be valid");
        env.add_template("evaluator", EVALUATOR_TEMPLATE)
            .expect("evaluator template should be valid");
        Self {
            env,
            history_window,
        }
    }

    pub fn render(&self, request: &ProposalRequest<'_>) -> Result<String> {
        let skip = request.history.len().saturating_sub(self.history_window);
        let elements = element_context(&request.snapshot.elements);
        let history = step_context(&request.history[skip..]);
        let actions: Vec<ActionHelp> = ActionKind::ALL
            .into_iter()
            .map(|kind| ActionHelp {
                kind: kind.as_str(),
                params: params_help(kind),
            })
            .collect();

        let template = self.env.get_template("proposer")?;
        let rendered = template.render(context! {
            case_name => request.spec.meta.name.trim(),
            goal => request.spec.meta.goal.trim(),
            inputs => &request.spec.inputs,
            screen_type => &request.snapshot.screen_type,
            elements => elements,
            history => history,
            feedback => request.feedback.map(str::trim).filter(|s| !s.is_empty()),
            actions => actions,
        })?;
        debug!(bytes = rendered.len(), "rendered proposer prompt");
        Ok(rendered)
    }

    /// Evaluator prompt over the whole history and the last screen seen.
    pub fn render_evaluation(&self, request: &EvaluationRequest<'_>) -> Result<String> {
        let elements = request
            .snapshot
            .map(|snapshot| element_context(&snapshot.elements))
            .unwrap_or_default();
        let template = self.env.get_template("evaluator")?;
        let rendered = template.render(context! {
            case_name => request.spec.meta.name.trim(),
            goal => request.spec.meta.goal.trim(),
            expected => request.spec.meta.expected.to_string(),
            verdict_result => request.verdict.result.to_string(),
            verdict_kind => request.verdict.kind.as_str(),
            verdict_reasoning => request.verdict.reasoning.trim(),
            budget_spent => request.overridable,
            history => step_context(request.history),
            screen_type => request.snapshot.map(|snapshot| snapshot.screen_type.as_str()),
            elements => elements,
        })?;
        debug!(bytes = rendered.len(), "rendered evaluator prompt");
        Ok(rendered)
    }
}
