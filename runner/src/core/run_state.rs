//! In-memory state of one run.
//!
//! History is append-only, the achieved-subgoal set only grows, and the
//! verdict is set exactly once. Violations are reported as [`RunStateError`]
//! rather than silently repaired.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::core::sequencer::SequencerState;
use crate::core::types::{ActionRecord, Verdict};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunStateError {
    #[error("verdict already set ({existing}); refusing to replace it")]
    VerdictAlreadySet { existing: String },
    #[error("record for step {got} appended out of order (expected step {expected})")]
    StepOutOfOrder { expected: u32, got: u32 },
    #[error("subgoal '{0}' credited twice")]
    DuplicateSubgoal(String),
    #[error("cannot append step {0} after the verdict")]
    Concluded(u32),
}

#[derive(Debug, Clone, Default)]
pub struct RunState {
    history: Vec<ActionRecord>,
    sequencer: SequencerState,
    achieved: BTreeSet<String>,
    verdict: Option<Verdict>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[ActionRecord] {
        &self.history
    }

    /// Steps taken so far; always equal to the history length.
    pub fn steps(&self) -> u32 {
        self.history.len() as u32
    }

    pub fn next_step(&self) -> u32 {
        self.steps() + 1
    }

    pub fn sequencer_state(&self) -> &SequencerState {
        &self.sequencer
    }

    pub fn set_sequencer_state(&mut self, state: SequencerState) {
        self.sequencer = state;
    }

    pub fn achieved(&self) -> &BTreeSet<String> {
        &self.achieved
    }

    /// Successful text entries so far.
    pub fn text_entries(&self) -> usize {
        self.history
            .iter()
            .filter(|r| r.outcome.success && r.action.kind().is_text_entry())
            .count()
    }

    pub fn last(&self) -> Option<&ActionRecord> {
        self.history.last()
    }

    pub fn append(&mut self, record: ActionRecord) -> Result<(), RunStateError> {
        if self.verdict.is_some() {
            return Err(RunStateError::Concluded(record.step));
        }
        let expected = self.next_step();
        if record.step != expected {
            return Err(RunStateError::StepOutOfOrder {
                expected,
                got: record.step,
            });
        }
        if let Some(name) = record
            .new_subgoals
            .iter()
            .find(|name| self.achieved.contains(*name))
        {
            return Err(RunStateError::DuplicateSubgoal(name.clone()));
        }
        self.achieved.extend(record.new_subgoals.iter().cloned());
        self.history.push(record);
        Ok(())
    }

    pub fn conclude(&mut self, verdict: Verdict) -> Result<&Verdict, RunStateError> {
        if let Some(existing) = &self.verdict {
            return Err(RunStateError::VerdictAlreadySet {
                existing: format!("{} {}", existing.result, existing.kind),
            });
        }
        Ok(self.verdict.insert(verdict))
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.as_ref()
    }

    pub fn into_history(self) -> Vec<ActionRecord> {
        self.history
    }
}
