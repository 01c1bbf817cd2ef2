//! Append-only JSONL log of steps as they complete (`steps.jsonl`).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::types::ActionRecord;

pub const STEP_LOG_FILE: &str = "steps.jsonl";

pub struct StepLog {
    path: PathBuf,
    file: File,
}

impl StepLog {
    /// Open (creating if needed) `steps.jsonl` inside `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        let path = dir.join(STEP_LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open step log {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &ActionRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize step")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("append to {}", self.path.display()))?;
        self.file
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))
    }
}

/// Read every step back in file order.
pub fn read_step_log(path: &Path) -> Result<Vec<ActionRecord>> {
    let file = File::open(path).with_context(|| format!("open step log {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::ActionProposal;
    use crate::test_support::record;

    #[test]
    fn appends_one_line_per_step() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("case/run");
        let mut log = StepLog::open(&dir).expect("open");
        let first = record(1, ActionProposal::NavigateBack);
        let second = record(2, ActionProposal::Wait { seconds: 1.0 });
        log.append(&first).expect("append");
        log.append(&second).expect("append");

        let contents = fs::read_to_string(log.path()).expect("read");
        assert_eq!(contents.lines().count(), 2);
        assert_eq!(read_step_log(log.path()).expect("parse"), vec![first, second]);
    }

    #[test]
    fn reopening_keeps_existing_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        StepLog::open(temp.path())
            .expect("open")
            .append(&record(1, ActionProposal::Confirm))
            .expect("append");
        let mut log = StepLog::open(temp.path()).expect("reopen");
        log.append(&record(2, ActionProposal::Confirm)).expect("append");
        assert_eq!(read_step_log(log.path()).expect("parse").len(), 2);
    }
}
