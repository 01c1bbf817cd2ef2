//! Mobile UI test runner.
//!
//! Drives one test case against an attached device, writes the run record,
//! and exits with a code derived from the verdict.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qa_runner::core::budget::Cancellation;
use qa_runner::core::resolver::Resolver;
use qa_runner::core::types::ScreenSnapshot;
use qa_runner::exit_codes;
use qa_runner::io::adb::parse_ui_dump;
use qa_runner::io::case::load_case;
use qa_runner::io::config::{apply_case_config, load_config};
use qa_runner::io::run_record::{load_run_record, new_run_id};
use qa_runner::logging;
use qa_runner::start::{StartRequest, start_device_run};
use serde_json::json;

#[derive(Parser)]
#[command(
    name = "qa-runner",
    version,
    about = "Goal-driven mobile UI test runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a case file.
    Validate {
        case: PathBuf,
        /// Also validate the runner config with the case overrides applied.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a case on the attached device.
    Run {
        case: PathBuf,
        #[arg(long, default_value = "qa-runner.toml")]
        config: PathBuf,
        /// Directory receiving `<case-id>/<run-id>/` artifacts.
        #[arg(long, default_value = "runs")]
        out: PathBuf,
        /// Abort the run at the next step boundary after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Device serial; overrides `device.serial` from the config.
        #[arg(long)]
        serial: Option<String>,
    },
    /// Recompute the reward breakdown of a persisted run record.
    Score {
        record: PathBuf,
        #[arg(long)]
        case: PathBuf,
    },
    /// Resolve target text against a uiautomator dump.
    Resolve {
        dump: PathBuf,
        text: String,
        #[arg(long, default_value_t = qa_runner::core::resolver::DEFAULT_LOWER_REGION_Y)]
        lower_region_y: i32,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { case, config } => cmd_validate(&case, config.as_deref()),
        Command::Run {
            case,
            config,
            out,
            deadline_secs,
            serial,
        } => cmd_run(&case, &config, &out, deadline_secs, serial),
        Command::Score { record, case } => cmd_score(&record, &case),
        Command::Resolve {
            dump,
            text,
            lower_region_y,
        } => cmd_resolve(&dump, &text, lower_region_y),
    }
}

fn cmd_validate(case: &Path, config: Option<&Path>) -> Result<i32> {
    let spec = load_case(case)?;
    if let Some(path) = config {
        apply_case_config(load_config(path)?, &spec.config)
            .with_context(|| format!("apply case overrides from {}", case.display()))?;
    }
    println!("ok {}", spec.meta.id);
    Ok(exit_codes::OK)
}

fn cmd_run(
    case: &Path,
    config: &Path,
    out: &Path,
    deadline_secs: Option<u64>,
    serial: Option<String>,
) -> Result<i32> {
    let spec = load_case(case)?;
    let mut cfg = apply_case_config(load_config(config)?, &spec.config)?;
    if serial.is_some() {
        cfg.device.serial = serial;
    }
    let cancel = match deadline_secs {
        Some(secs) => Cancellation::with_deadline(Duration::from_secs(secs)),
        None => Cancellation::new(),
    };
    let run_id = new_run_id();
    let outcome = start_device_run(&StartRequest {
        spec: &spec,
        config: &cfg,
        out,
        run_id: &run_id,
        cancel: &cancel,
    })?;

    let record = &outcome.record;
    let summary = json!({
        "run_id": record.run_id,
        "case_id": record.case_id,
        "result": record.verdict.result,
        "result_kind": record.verdict.kind,
        "reasoning": record.verdict.reasoning,
        "bug_report": record.verdict.bug_report,
        "steps": record.history.len(),
        "reward": record.reward.total,
        "plan_adherence": record.reward.plan_adherence,
        "action_efficiency": record.reward.action_efficiency,
        "matches_expected": record.reward.matches_expected,
        "record": outcome.record_path,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(exit_codes::for_verdict(&record.verdict))
}

fn cmd_score(record: &Path, case: &Path) -> Result<i32> {
    let run = load_run_record(record)?;
    let spec = load_case(case)?;
    if spec.meta.id != run.case_id {
        anyhow::bail!(
            "record is for case '{}' but {} defines '{}'",
            run.case_id,
            case.display(),
            spec.meta.id
        );
    }
    let breakdown = run.rescore(&spec);
    println!("{}", serde_json::to_string_pretty(&breakdown)?);
    Ok(exit_codes::OK)
}

fn cmd_resolve(dump: &Path, text: &str, lower_region_y: i32) -> Result<i32> {
    let xml = fs::read_to_string(dump).with_context(|| format!("read {}", dump.display()))?;
    let snapshot = ScreenSnapshot::new(parse_ui_dump(&xml), "unknown");
    let resolver = Resolver::new(lower_region_y);
    let element = resolver.resolve(text, &snapshot, true)?;
    let (x, y) = element.center();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "text": element.text,
            "role": element.role,
            "clickable": element.clickable,
            "bounds": element.bounds,
            "center": [x, y],
        }))?
    );
    Ok(exit_codes::OK)
}
