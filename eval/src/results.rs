//! Result capture and persistence.
//!
//! Each eval run lives in `eval/results/<case-id>/<eval-run-id>/`. The runner
//! writes `record.json` and `steps.jsonl` there; eval adds `meta.json` with
//! the case hash, device serial, and classified outcome.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use qa_runner::core::types::ResultKind;

use crate::outcome::Outcome;

pub const META_FILE: &str = "meta.json";

/// Metadata for an eval run, persisted to `meta.json`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EvalMeta {
    pub case_id: String,
    pub eval_run_id: String,
    /// SHA-256 hash of the case file for reproducibility tracking.
    pub case_hash: String,
    /// Device the run was assigned to; `None` uses the config default.
    pub serial: Option<String>,
    pub outcome: Outcome,
    pub result_kind: Option<ResultKind>,
    pub matches_expected: Option<bool>,
    pub steps: Option<usize>,
    /// Evaluator's defect description for a failing run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bug_report: Option<String>,
    /// Path to the runner's `record.json`, when the run produced one.
    pub record: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    /// Non-fatal errors encountered during the run or capture.
    pub errors: Vec<String>,
}

impl EvalMeta {
    pub fn timing(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) {
        self.start_time = started_at.to_rfc3339();
        self.end_time = finished_at.to_rfc3339();
        self.duration_secs = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
    }
}

pub fn results_dir(base_dir: &Path, case_id: &str, eval_run_id: &str) -> PathBuf {
    base_dir.join(case_id).join(eval_run_id)
}

/// `eval-<utc timestamp>-<random hex>`; unique across concurrent workers.
pub fn new_eval_run_id() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..=u32::MAX);
    format!("eval-{}-{suffix:08x}", Utc::now().format("%Y%m%d_%H%M%S"))
}

pub fn write_meta(run_dir: &Path, meta: &EvalMeta) -> Result<PathBuf> {
    fs::create_dir_all(run_dir).with_context(|| format!("create {}", run_dir.display()))?;
    let path = run_dir.join(META_FILE);
    let contents = serde_json::to_string_pretty(meta).context("serialize meta")?;
    fs::write(&path, format!("{contents}\n"))
        .with_context(|| format!("write meta {}", path.display()))?;
    Ok(path)
}

pub fn load_meta(run_dir: &Path) -> Result<EvalMeta> {
    let path = run_dir.join(META_FILE);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    let digest = hasher.finalize();
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta() -> EvalMeta {
        EvalMeta {
            case_id: "create-vault".to_string(),
            eval_run_id: "eval-1".to_string(),
            case_hash: "hash".to_string(),
            serial: Some("emulator-5554".to_string()),
            outcome: Outcome::Passed,
            result_kind: Some(ResultKind::TestPassed),
            matches_expected: Some(true),
            steps: Some(4),
            bug_report: None,
            record: None,
            start_time: String::new(),
            end_time: String::new(),
            duration_secs: 0.0,
            errors: Vec::new(),
        }
    }

    #[test]
    fn results_dir_is_stable() {
        let base = Path::new("/tmp/results");
        let dir = results_dir(base, "case", "run-1");
        assert_eq!(dir, PathBuf::from("/tmp/results/case/run-1"));
    }

    #[test]
    fn eval_run_ids_carry_a_random_suffix() {
        let first = new_eval_run_id();
        assert!(first.starts_with("eval-"));
        let suffix = first.rsplit('-').next().expect("suffix");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn meta_round_trips_through_disk() {
        let temp = tempdir().expect("tempdir");
        let run_dir = temp.path().join("create-vault/eval-1");
        let mut written = meta();
        let started = Utc::now();
        written.timing(started, started + chrono::Duration::milliseconds(2500));
        assert_eq!(written.duration_secs, 2.5);

        let path = write_meta(&run_dir, &written).expect("write");
        assert!(path.ends_with("create-vault/eval-1/meta.json"));
        assert_eq!(load_meta(&run_dir).expect("load"), written);
    }

    #[test]
    fn hashes_case_file_contents() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("case.toml");
        fs::write(&path, "abc").expect("write");
        assert_eq!(
            file_sha256(&path).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(file_sha256(&temp.path().join("missing.toml")).is_err());
    }
}
