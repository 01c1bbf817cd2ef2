//! Persisted run records under `<out>/<case-id>/<run-id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::metrics::{RewardBreakdown, RewardConfig, summarize};
use crate::core::test_spec::TestSpec;
use crate::core::types::{ActionRecord, TestResult, Verdict};
use crate::io::write_atomic;

pub const RECORD_FILE: &str = "record.json";

/// Everything one run produced: ordered history, score, and verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub case_id: String,
    pub case_name: String,
    pub expected: TestResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Weights the reward was computed with.
    pub reward_config: RewardConfig,
    pub history: Vec<ActionRecord>,
    pub reward: RewardBreakdown,
    pub verdict: Verdict,
}

impl RunRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0)
    }

    /// Recompute the breakdown from the persisted history.
    pub fn rescore(&self, spec: &TestSpec) -> RewardBreakdown {
        summarize(
            &self.reward_config,
            spec,
            &self.history,
            &self.verdict,
            Some(self.duration_ms()),
        )
    }
}

/// Directory holding one run's artifacts.
pub fn run_dir(out: &Path, case_id: &str, run_id: &str) -> PathBuf {
    out.join(case_id).join(run_id)
}

/// Atomically write `record` and return its path.
pub fn write_run_record(out: &Path, record: &RunRecord) -> Result<PathBuf> {
    let path = run_dir(out, &record.case_id, &record.run_id).join(RECORD_FILE);
    debug!(path = %path.display(), verdict = %record.verdict.kind, "writing run record");
    let mut buf = serde_json::to_string_pretty(record).context("serialize run record")?;
    buf.push('\n');
    write_atomic(&path, &buf)?;
    Ok(path)
}

pub fn load_run_record(path: &Path) -> Result<RunRecord> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run record {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse run record {}", path.display()))
}

/// Timestamp-based run id; unique per process and second.
pub fn new_run_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        std::process::id()
    )
}
