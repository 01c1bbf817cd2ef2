//! Orchestration for starting a run and persisting its artifacts.
//!
//! A "run" is one execution of one case, identified by a `run_id`. Starting a
//! run opens `<out>/<case-id>/<run-id>/steps.jsonl`, drives
//! [`run_test`](crate::looping::run_test) while appending each step, and writes
//! `record.json` once the verdict is in.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::budget::Cancellation;
use crate::core::test_spec::TestSpec;
use crate::io::adb::AdbDevice;
use crate::io::config::RunnerConfig;
use crate::io::device::{DeviceExecutor, SnapshotProvider};
use crate::io::evaluator::{CommandEvaluator, Evaluator};
use crate::io::proposer::{CommandProposer, Proposer};
use crate::io::run_record::{RunRecord, run_dir, write_run_record};
use crate::io::step_log::StepLog;
use crate::looping::run_test;

/// Inputs for one run. `config` already has the case overrides applied.
#[derive(Debug, Clone, Copy)]
pub struct StartRequest<'a> {
    pub spec: &'a TestSpec,
    pub config: &'a RunnerConfig,
    pub out: &'a Path,
    pub run_id: &'a str,
    pub cancel: &'a Cancellation,
}

/// Outcome of a started run.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub record: RunRecord,
    pub record_path: PathBuf,
    pub step_log_path: PathBuf,
}

/// Run `request.spec` with the given collaborators and persist the result.
pub fn start_run<D, P>(
    request: &StartRequest<'_>,
    device: &mut D,
    proposer: &mut P,
    evaluator: Option<&mut dyn Evaluator>,
) -> Result<StartOutcome>
where
    D: SnapshotProvider + DeviceExecutor,
    P: Proposer,
{
    let dir = run_dir(request.out, &request.spec.meta.id, request.run_id);
    debug!(dir = %dir.display(), "starting run");
    let mut step_log = StepLog::open(&dir)?;
    let step_log_path = step_log.path().to_path_buf();

    let record = run_test(
        request.spec,
        request.config,
        request.run_id,
        device,
        proposer,
        evaluator,
        request.cancel,
        |record| {
            // The step log is a progress trail; record.json is authoritative.
            if let Err(err) = step_log.append(record) {
                warn!(step = record.step, err = %err, "step log append failed");
            }
        },
    )?;

    let record_path = write_run_record(request.out, &record)?;
    info!(path = %record_path.display(), "run record written");
    Ok(StartOutcome {
        record,
        record_path,
        step_log_path,
    })
}

/// Run against a real device over adb with the configured proposer command,
/// and the evaluator command when one is configured.
pub fn start_device_run(request: &StartRequest<'_>) -> Result<StartOutcome> {
    let mut proposer = CommandProposer::new(&request.config.proposer, request.config.history_window)
        .context("configure proposer")?;
    let mut evaluator = if request.config.evaluator.is_enabled() {
        Some(CommandEvaluator::new(&request.config.evaluator).context("configure evaluator")?)
    } else {
        None
    };
    let mut device = AdbDevice::new(request.config.device.clone(), request.spec.screens.clone());
    if let Some(package) = &request.spec.meta.app_package {
        device
            .prepare_app(package, request.cancel.bound(request.config.step_timeout()))
            .with_context(|| format!("prepare {package}"))?;
    }
    start_run(
        request,
        &mut device,
        &mut proposer,
        evaluator.as_mut().map(|e| e as &mut dyn Evaluator),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ResultKind;
    use crate::io::run_record::load_run_record;
    use crate::io::step_log::read_step_log;
    use crate::test_support::{ScriptedDevice, ScriptedProposer, SpecBuilder, button, snapshot};
    use serde_json::json;

    #[test]
    fn writes_record_and_step_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = SpecBuilder::new("open-settings").build();
        let config = RunnerConfig::default();
        let cancel = Cancellation::new();
        let mut device = ScriptedDevice::new(vec![snapshot("home", vec![button("Settings", 1800)])]);
        let mut proposer = ScriptedProposer::new(vec![
            ("tap-by-target", json!({"text": "Settings"})),
            ("declare-failed", json!({"reason": "settings never opened"})),
        ]);

        let outcome = start_run(
            &StartRequest {
                spec: &spec,
                config: &config,
                out: temp.path(),
                run_id: "run-7",
                cancel: &cancel,
            },
            &mut device,
            &mut proposer,
            None,
        )
        .expect("start");

        assert_eq!(outcome.record.verdict.kind, ResultKind::TestAssertionFailed);
        assert!(outcome.record_path.ends_with("open-settings/run-7/record.json"));
        assert_eq!(load_run_record(&outcome.record_path).expect("load").history.len(), 2);
        let steps = read_step_log(&outcome.step_log_path).expect("steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps, outcome.record.history);
    }

    #[test]
    fn device_run_requires_a_proposer_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = SpecBuilder::new("open-settings").build();
        let config = RunnerConfig::default();
        let err = start_device_run(&StartRequest {
            spec: &spec,
            config: &config,
            out: temp.path(),
            run_id: "run-1",
            cancel: &Cancellation::new(),
        })
        .expect_err("no proposer command");
        assert!(format!("{err:#}").contains("proposer.command"));
    }
}
