use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use qa_runner::io::run_record::{RECORD_FILE, load_run_record};

use crate::outcome::Outcome;
use crate::results::load_meta;

#[derive(Debug, Default, PartialEq)]
pub struct ReportSummary {
    pub runs: usize,
    pub passed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub error: usize,
    /// Runs whose verdict matched the case's expected result.
    pub matches_expected: usize,
    /// Runs the evaluator attached a bug report to.
    pub bug_reports: usize,
    pub mean_reward: Option<f64>,
    pub mean_plan_adherence: Option<f64>,
    pub mean_action_efficiency: Option<f64>,
    pub avg_duration_secs: Option<f64>,
}

pub fn load_run_dirs(case_results_dir: &Path) -> Result<Vec<PathBuf>> {
    if !case_results_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(case_results_dir)
        .with_context(|| format!("read {}", case_results_dir.display()))?
    {
        let entry = entry.context("read entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Aggregate every run under `eval/results/<case-id>/`.
///
/// Reward metrics come from each run's `record.json`; runs without one only
/// count toward outcomes and duration.
pub fn aggregate(case_results_dir: &Path) -> Result<(ReportSummary, Vec<String>)> {
    let mut summary = ReportSummary::default();
    let mut warnings = Vec::new();
    let mut rewards = Vec::new();
    let mut adherence = Vec::new();
    let mut efficiency = Vec::new();
    let mut durations = Vec::new();

    for run_dir in load_run_dirs(case_results_dir)? {
        let meta = match load_meta(&run_dir) {
            Ok(meta) => meta,
            Err(err) => {
                warnings.push(format!(
                    "skip {}: meta.json invalid ({err:#})",
                    run_dir.display()
                ));
                continue;
            }
        };

        summary.runs += 1;
        match meta.outcome {
            Outcome::Passed => summary.passed += 1,
            Outcome::Failed => summary.failed += 1,
            Outcome::Aborted => summary.aborted += 1,
            Outcome::Error => summary.error += 1,
        }
        if meta.matches_expected == Some(true) {
            summary.matches_expected += 1;
        }
        if meta.bug_report.is_some() {
            summary.bug_reports += 1;
        }
        durations.push(meta.duration_secs);

        if meta.result_kind.is_none() {
            continue;
        }
        match load_run_record(&run_dir.join(RECORD_FILE)) {
            Ok(record) => {
                rewards.push(record.reward.total);
                adherence.push(record.reward.plan_adherence);
                efficiency.push(record.reward.action_efficiency);
            }
            Err(err) => warnings.push(format!(
                "{}: no reward metrics ({err:#})",
                run_dir.display()
            )),
        }
    }

    summary.mean_reward = mean(&rewards);
    summary.mean_plan_adherence = mean(&adherence);
    summary.mean_action_efficiency = mean(&efficiency);
    summary.avg_duration_secs = mean(&durations);
    Ok((summary, warnings))
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
