//! Final evaluator consulted once per run after the loop ends.
//!
//! The evaluator reviews the whole history and the last screen. It may replace
//! a verdict produced by budget exhaustion; any other verdict keeps its result,
//! kind, and reasoning, and only gains a bug report when it is a failure.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::test_spec::TestSpec;
use crate::core::types::{ActionRecord, ResultKind, ScreenSnapshot, TestResult, Verdict};
use crate::io::config::EvaluatorConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::PromptBuilder;
use crate::io::proposer::extract_json;

const EVALUATION_SCHEMA: &str = include_str!("../../schemas/evaluation.schema.json");

/// Everything the evaluator sees about a finished run.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationRequest<'a> {
    pub spec: &'a TestSpec,
    pub history: &'a [ActionRecord],
    /// Last screen captured; `None` when the first capture failed.
    pub snapshot: Option<&'a ScreenSnapshot>,
    /// The runner's own verdict.
    pub verdict: &'a Verdict,
    /// The verdict came from budget exhaustion and may be replaced.
    pub overridable: bool,
}

/// The evaluator's judgement of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub result: TestResult,
    pub result_kind: ResultKind,
    pub reasoning: String,
    #[serde(default)]
    pub bug_report: Option<String>,
}

impl Evaluation {
    /// Fold this judgement into the runner's verdict.
    pub fn settle(self, pending: &Verdict, overridable: bool) -> Verdict {
        let bug_report = self
            .bug_report
            .map(|report| report.trim().to_string())
            .filter(|report| !report.is_empty());
        if overridable {
            let bug_report = bug_report.filter(|_| self.result == TestResult::Fail);
            return Verdict {
                result: self.result,
                kind: self.result_kind,
                reasoning: self.reasoning,
                bug_report,
            };
        }
        let mut verdict = pending.clone();
        if verdict.result == TestResult::Fail && verdict.bug_report.is_none() {
            verdict.bug_report = bug_report;
        }
        verdict
    }
}

pub trait Evaluator {
    fn evaluate(&mut self, request: &EvaluationRequest<'_>) -> Result<Evaluation>;
}

/// Ask `evaluator` about the finished run and settle the final verdict.
///
/// Evaluator failures are logged and leave the runner's verdict in place.
pub fn final_verdict(evaluator: &mut dyn Evaluator, request: &EvaluationRequest<'_>) -> Verdict {
    match evaluator.evaluate(request) {
        Ok(evaluation) => {
            info!(
                result = %evaluation.result,
                kind = %evaluation.result_kind,
                overridable = request.overridable,
                bug_report = evaluation.bug_report.is_some(),
                "evaluator answered"
            );
            evaluation.settle(request.verdict, request.overridable)
        }
        Err(err) => {
            let err = format!("{err:#}");
            warn!(err = %err, "evaluator failed; keeping runner verdict");
            request.verdict.clone()
        }
    }
}

/// Evaluator that runs a configured command with the prompt on stdin and
/// reads one JSON evaluation from its stdout.
pub struct CommandEvaluator {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    prompt: PromptBuilder,
    schema: Validator,
}

impl CommandEvaluator {
    pub fn new(config: &EvaluatorConfig) -> Result<Self> {
        if !config.is_enabled() {
            return Err(anyhow!("evaluator.command is not configured"));
        }
        let schema_value: Value =
            serde_json::from_str(EVALUATION_SCHEMA).context("parse evaluation schema")?;
        let schema = validator_for(&schema_value)
            .map_err(|err| anyhow!("invalid evaluation schema: {err}"))?;
        Ok(Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            prompt: PromptBuilder::new(0),
            schema,
        })
    }
}

impl Evaluator for CommandEvaluator {
    #[instrument(skip_all, fields(steps = request.history.len(), overridable = request.overridable))]
    fn evaluate(&mut self, request: &EvaluationRequest<'_>) -> Result<Evaluation> {
        let prompt = self.prompt.render_evaluation(request)?;
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        info!(program = %self.command[0], "asking evaluator");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run evaluator command")?;
        if output.timed_out {
            return Err(anyhow!("evaluator timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "evaluator exited with {:?}: {}",
                output.status.code(),
                output.diagnostic()
            ));
        }
        let evaluation = parse_evaluation_output(&output.stdout_lossy(), &self.schema)?;
        debug!(result = %evaluation.result, "evaluator answered");
        Ok(evaluation)
    }
}

/// Extract and shape-check the evaluation JSON from evaluator stdout.
pub fn parse_evaluation_output(stdout: &str, schema: &Validator) -> Result<Evaluation> {
    let json = extract_json(stdout).ok_or_else(|| anyhow!("no JSON object in evaluator output"))?;
    let value: Value = serde_json::from_str(json).context("parse evaluator JSON")?;
    let errors: Vec<String> = schema
        .iter_errors(&value)
        .map(|err| format!("{} at {}", err, err.instance_path()))
        .collect();
    if !errors.is_empty() {
        return Err(anyhow!("evaluation shape invalid:\n- {}", errors.join("\n- ")));
    }
    let evaluation: Evaluation = serde_json::from_value(value).context("decode evaluation")?;
    if (evaluation.result == TestResult::Pass) != (evaluation.result_kind == ResultKind::TestPassed)
    {
        return Err(anyhow!(
            "evaluation result {} disagrees with result_kind {}",
            evaluation.result,
            evaluation.result_kind
        ));
    }
    Ok(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Validator {
        let value: Value = serde_json::from_str(EVALUATION_SCHEMA).expect("schema json");
        validator_for(&value).expect("schema")
    }

    fn evaluation(result: TestResult, kind: ResultKind, bug: Option<&str>) -> Evaluation {
        Evaluation {
            result,
            result_kind: kind,
            reasoning: "judged from the final screen".to_string(),
            bug_report: bug.map(str::to_string),
        }
    }

    #[test]
    fn parses_fenced_evaluation() {
        let out = "Verdict below.\n```json\n{\"result\": \"FAIL\", \"result_kind\": \"test_assertion_failed\", \"reasoning\": \"note missing\", \"bug_report\": \"Create button does nothing\"}\n```";
        let parsed = parse_evaluation_output(out, &schema()).expect("parse");
        assert_eq!(parsed.result, TestResult::Fail);
        assert_eq!(parsed.result_kind, ResultKind::TestAssertionFailed);
        assert_eq!(parsed.bug_report.as_deref(), Some("Create button does nothing"));
    }

    #[test]
    fn rejects_aborted_and_inconsistent_answers() {
        let aborted = r#"{"result": "FAIL", "result_kind": "aborted", "reasoning": "x"}"#;
        let err = parse_evaluation_output(aborted, &schema()).expect_err("aborted");
        assert!(err.to_string().contains("evaluation shape invalid"));

        let mixed = r#"{"result": "PASS", "result_kind": "element_not_found", "reasoning": "x"}"#;
        let err = parse_evaluation_output(mixed, &schema()).expect_err("mixed");
        assert!(err.to_string().contains("disagrees"));

        assert!(parse_evaluation_output("no idea", &schema()).is_err());
    }

    #[test]
    fn overridable_verdict_is_replaced() {
        let pending = Verdict::execution_error("step budget of 20 exhausted");
        let settled = evaluation(TestResult::Pass, ResultKind::TestPassed, Some("ignored"))
            .settle(&pending, true);
        assert!(settled.is_pass());
        assert_eq!(settled.kind, ResultKind::TestPassed);
        assert_eq!(settled.reasoning, "judged from the final screen");
        assert_eq!(settled.bug_report, None);
    }

    #[test]
    fn fixed_verdict_only_gains_a_bug_report() {
        let pending = Verdict::failed(ResultKind::ElementNotFound, "no 'Create' on screen");
        let settled = evaluation(TestResult::Pass, ResultKind::TestPassed, Some(" Button hidden "))
            .settle(&pending, false);
        assert_eq!(settled.kind, ResultKind::ElementNotFound);
        assert_eq!(settled.reasoning, "no 'Create' on screen");
        assert_eq!(settled.bug_report.as_deref(), Some("Button hidden"));

        let passed = Verdict::passed("success predicate held");
        let settled = evaluation(TestResult::Fail, ResultKind::TestAssertionFailed, Some("bug"))
            .settle(&passed, false);
        assert_eq!(settled, passed);
    }

    #[test]
    fn requires_a_command() {
        assert!(CommandEvaluator::new(&EvaluatorConfig::default()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn runs_command_and_reads_stdout() {
        use crate::test_support::{SpecBuilder, snapshot};

        let config = EvaluatorConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo '{\"result\":\"PASS\",\"result_kind\":\"test_passed\",\"reasoning\":\"note is open\"}'"
                    .to_string(),
            ],
            ..EvaluatorConfig::default()
        };
        let mut evaluator = CommandEvaluator::new(&config).expect("evaluator");
        let spec = SpecBuilder::new("create-note").build();
        let snap = snapshot("inside_vault", Vec::new());
        let verdict = Verdict::execution_error("step budget of 20 exhausted");
        let evaluation = evaluator
            .evaluate(&EvaluationRequest {
                spec: &spec,
                history: &[],
                snapshot: Some(&snap),
                verdict: &verdict,
                overridable: true,
            })
            .expect("evaluate");
        assert_eq!(evaluation.result_kind, ResultKind::TestPassed);
        assert_eq!(evaluation.bug_report, None);
    }
}
