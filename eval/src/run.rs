//! Suite execution.
//!
//! Queued runs are drained by one worker thread per device serial. Every run
//! gets its own eval run id, runner artifacts, and `meta.json`, whether or not
//! the runner reached a verdict.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use qa_runner::core::budget::Cancellation;
use qa_runner::core::test_spec::TestSpec;
use qa_runner::io::config::{RunnerConfig, apply_case_config};
use qa_runner::start::{StartOutcome, StartRequest};

use crate::outcome::{Outcome, classify_outcome};
use crate::results::{EvalMeta, file_sha256, new_eval_run_id, results_dir, write_meta};

/// A case queued for execution.
#[derive(Debug, Clone)]
pub struct EvalJob {
    pub case_path: PathBuf,
    pub spec: TestSpec,
}

#[derive(Debug, Clone, Copy)]
pub struct SuiteOptions<'a> {
    /// `eval/results`; runs land in `<results_root>/<case-id>/<eval-run-id>/`.
    pub results_root: &'a Path,
    /// Runner config before per-case overrides.
    pub config: &'a RunnerConfig,
    /// Runs per case.
    pub runs: u32,
    pub deadline: Option<Duration>,
}

/// Result of running a single case once.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub case_id: String,
    pub eval_run_id: String,
    pub serial: Option<String>,
    pub results_dir: PathBuf,
    pub outcome: Outcome,
}

/// Run every job `options.runs` times, one worker per serial.
///
/// With no serials a single worker uses the device from the config. `launch`
/// performs one run; [`qa_runner::start::start_device_run`] in production.
pub fn run_suite<L>(
    jobs: &[EvalJob],
    serials: &[String],
    options: &SuiteOptions<'_>,
    launch: L,
) -> Vec<RunOutcome>
where
    L: Fn(&StartRequest<'_>) -> Result<StartOutcome> + Sync,
{
    let queue: VecDeque<&EvalJob> = (0..options.runs)
        .flat_map(|_| jobs.iter())
        .collect();
    let total = queue.len();
    let queue = Mutex::new(queue);
    let workers: Vec<Option<&str>> = if serials.is_empty() {
        vec![None]
    } else {
        serials.iter().map(|serial| Some(serial.as_str())).collect()
    };
    info!(runs = total, workers = workers.len(), "suite started");

    let mut outcomes = Vec::with_capacity(total);
    thread::scope(|scope| {
        let handles: Vec<_> = workers
            .iter()
            .map(|&serial| {
                let queue = &queue;
                let launch = &launch;
                scope.spawn(move || {
                    let mut done = Vec::new();
                    loop {
                        let Some(job) = next_job(queue) else {
                            break;
                        };
                        match run_case(job, serial, options, launch) {
                            Ok(outcome) => done.push(outcome),
                            Err(err) => {
                                warn!(case_id = %job.spec.meta.id, err = ?err, "run not recorded");
                            }
                        }
                    }
                    done
                })
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(done) => outcomes.extend(done),
                Err(_) => warn!("eval worker panicked"),
            }
        }
    });
    outcomes
}

/// Pop the next queued run. A poisoned queue is still drained.
fn next_job<'a>(queue: &Mutex<VecDeque<&'a EvalJob>>) -> Option<&'a EvalJob> {
    if queue.is_poisoned() {
        warn!("eval queue poisoned by a panicked worker; draining anyway");
    }
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
}

/// Run one case once and write its `meta.json`.
///
/// Runner failures are recorded as [`Outcome::Error`]; only failing to
/// persist the metadata is an error here.
#[instrument(skip_all, fields(case_id = %job.spec.meta.id, serial = ?serial))]
pub fn run_case<L>(
    job: &EvalJob,
    serial: Option<&str>,
    options: &SuiteOptions<'_>,
    launch: &L,
) -> Result<RunOutcome>
where
    L: Fn(&StartRequest<'_>) -> Result<StartOutcome>,
{
    let case_id = job.spec.meta.id.as_str();
    let eval_run_id = new_eval_run_id();
    let run_dir = results_dir(options.results_root, case_id, &eval_run_id);
    let mut errors = Vec::new();
    let case_hash = match file_sha256(&job.case_path) {
        Ok(hash) => hash,
        Err(err) => {
            errors.push(format!("case hash: {err:#}"));
            String::new()
        }
    };

    let started_at = Utc::now();
    let started = apply_case_config(options.config.clone(), &job.spec.config).and_then(|mut cfg| {
        if let Some(serial) = serial {
            cfg.device.serial = Some(serial.to_string());
        }
        let cancel = match options.deadline {
            Some(limit) => Cancellation::with_deadline(limit),
            None => Cancellation::new(),
        };
        debug!(eval_run_id = %eval_run_id, "launching run");
        launch(&StartRequest {
            spec: &job.spec,
            config: &cfg,
            out: options.results_root,
            run_id: &eval_run_id,
            cancel: &cancel,
        })
    });
    let finished_at = Utc::now();

    let mut meta = EvalMeta {
        case_id: case_id.to_string(),
        eval_run_id: eval_run_id.clone(),
        case_hash,
        serial: serial.map(str::to_string),
        outcome: Outcome::Error,
        result_kind: None,
        matches_expected: None,
        steps: None,
        bug_report: None,
        record: None,
        start_time: String::new(),
        end_time: String::new(),
        duration_secs: 0.0,
        errors,
    };
    match &started {
        Ok(started) => {
            let record = &started.record;
            meta.outcome = classify_outcome(Some(&record.verdict));
            meta.result_kind = Some(record.verdict.kind);
            meta.matches_expected = Some(record.reward.matches_expected);
            meta.steps = Some(record.history.len());
            meta.bug_report = record.verdict.bug_report.clone();
            meta.record = Some(started.record_path.display().to_string());
        }
        Err(err) => {
            let err = format!("{err:#}");
            warn!(err = %err, "run failed before a verdict");
            meta.errors.push(format!("run: {err}"));
        }
    }
    meta.timing(started_at, finished_at);
    write_meta(&run_dir, &meta).context("write meta")?;

    info!(outcome = ?meta.outcome, results_dir = %run_dir.display(), "case run complete");
    Ok(RunOutcome {
        case_id: case_id.to_string(),
        eval_run_id,
        serial: meta.serial,
        results_dir: run_dir,
        outcome: meta.outcome,
    })
}
