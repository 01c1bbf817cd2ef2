//! Proposer abstraction for choosing the next action.
//!
//! The [`Proposer`] trait decouples the run loop from the backend that picks
//! actions (usually a model behind a CLI). Output is untrusted: the loop
//! validates every proposal against the action vocabulary.

use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::action::RawProposal;
use crate::core::test_spec::TestSpec;
use crate::core::types::{ActionRecord, ScreenSnapshot};
use crate::io::config::ProposerConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::PromptBuilder;

const PROPOSAL_SCHEMA: &str = include_str!("../../schemas/proposal.schema.json");

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json regex")
});

/// Everything a proposer sees for one decision.
#[derive(Debug, Clone, Copy)]
pub struct ProposalRequest<'a> {
    pub spec: &'a TestSpec,
    pub history: &'a [ActionRecord],
    pub snapshot: &'a ScreenSnapshot,
    /// Why the previous answer in this step was rejected, if it was.
    pub feedback: Option<&'a str>,
}

pub trait Proposer {
    fn propose(&mut self, request: &ProposalRequest<'_>) -> Result<RawProposal>;
}

/// Proposer that runs a configured command with the prompt on stdin and
/// reads one JSON proposal from its stdout.
pub struct CommandProposer {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    prompt: PromptBuilder,
    schema: Validator,
}

impl CommandProposer {
    pub fn new(config: &ProposerConfig, history_window: usize) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("proposer.command is not configured"));
        }
        let schema_value: Value =
            serde_json::from_str(PROPOSAL_SCHEMA).context("parse proposal schema")?;
        let schema =
            validator_for(&schema_value).map_err(|err| anyhow!("invalid proposal schema: {err}"))?;
        Ok(Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            prompt: PromptBuilder::new(history_window),
            schema,
        })
    }
}

impl Proposer for CommandProposer {
    #[instrument(skip_all, fields(step = request.history.len() + 1, reprompt = request.feedback.is_some()))]
    fn propose(&mut self, request: &ProposalRequest<'_>) -> Result<RawProposal> {
        let prompt = self.prompt.render(request)?;
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        info!(program = %self.command[0], "asking proposer");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run proposer command")?;
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "proposer timed out");
            return Err(anyhow!("proposer timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "proposer exited with {:?}: {}",
                output.status.code(),
                output.diagnostic()
            ));
        }
        let proposal = parse_proposal_output(&output.stdout_lossy(), &self.schema)?;
        debug!(kind = %proposal.kind, "proposer answered");
        Ok(proposal)
    }
}

/// Extract and shape-check the proposal JSON from proposer stdout.
///
/// Accepts a fenced ```json block or the first balanced `{...}` span.
pub fn parse_proposal_output(stdout: &str, schema: &Validator) -> Result<RawProposal> {
    let json = extract_json(stdout).ok_or_else(|| anyhow!("no JSON object in proposer output"))?;
    let value: Value = serde_json::from_str(json).context("parse proposer JSON")?;
    let errors: Vec<String> = schema
        .iter_errors(&value)
        .map(|err| format!("{} at {}", err, err.instance_path()))
        .collect();
    if !errors.is_empty() {
        return Err(anyhow!("proposal shape invalid:\n- {}", errors.join("\n- ")));
    }
    serde_json::from_value(value).context("decode proposal")
}

pub(crate) fn extract_json(text: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON_RE.captures(text) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}
