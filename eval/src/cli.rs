//! CLI command implementations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use qa_runner::io::case::{discover_case_files, load_case};
use qa_runner::io::config::load_config;
use qa_runner::start::start_device_run;

use crate::outcome::Outcome;
use crate::report::aggregate;
use crate::run::{EvalJob, SuiteOptions, run_suite};

/// Options for `qa-eval run`.
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// A case id, or `all` for every discovered case.
    pub case_id: String,
    pub runs: u32,
    pub serials: Vec<String>,
    pub config: PathBuf,
    pub deadline_secs: Option<u64>,
}

fn cases_dir(repo_root: &Path) -> PathBuf {
    repo_root.join("eval").join("cases")
}

fn results_root(repo_root: &Path) -> PathBuf {
    repo_root.join("eval").join("results")
}

/// List all available cases.
pub fn list_cases(repo_root: &Path) -> Result<()> {
    for (_, spec) in discover_case_files(&cases_dir(repo_root))? {
        println!("{}\t{}\t{}", spec.meta.id, spec.meta.expected, spec.meta.name);
    }
    Ok(())
}

/// Run one case, or the whole suite with `all`. Returns false when any run
/// ended in error.
pub fn run_cases(repo_root: &Path, args: &RunArgs) -> Result<bool> {
    if args.runs == 0 {
        bail!("--runs must be > 0");
    }
    let jobs = select_jobs(&cases_dir(repo_root), &args.case_id)?;
    let config_path = repo_root.join(&args.config);
    let config = load_config(&config_path).context("load runner config")?;
    debug!(jobs = jobs.len(), runs = args.runs, "cases selected");

    let results = results_root(repo_root);
    let options = SuiteOptions {
        results_root: &results,
        config: &config,
        runs: args.runs,
        deadline: args.deadline_secs.map(Duration::from_secs),
    };
    let outcomes = run_suite(&jobs, &args.serials, &options, start_device_run);
    for outcome in &outcomes {
        println!(
            "run: case={} eval_run_id={} serial={} outcome={:?} results={}",
            outcome.case_id,
            outcome.eval_run_id,
            outcome.serial.as_deref().unwrap_or("-"),
            outcome.outcome,
            outcome.results_dir.display()
        );
    }
    let expected = jobs.len() * args.runs as usize;
    info!(expected, recorded = outcomes.len(), "suite finished");
    Ok(outcomes.len() == expected && outcomes.iter().all(|o| o.outcome != Outcome::Error))
}

fn select_jobs(cases_dir: &Path, case_id: &str) -> Result<Vec<EvalJob>> {
    if case_id == "all" {
        let jobs: Vec<EvalJob> = discover_case_files(cases_dir)?
            .into_iter()
            .map(|(case_path, spec)| EvalJob { case_path, spec })
            .collect();
        if jobs.is_empty() {
            bail!("no cases found in {}", cases_dir.display());
        }
        return Ok(jobs);
    }
    let case_path = cases_dir.join(format!("{case_id}.toml"));
    if !case_path.exists() {
        bail!("case {} not found at {}", case_id, case_path.display());
    }
    let spec = load_case(&case_path)?;
    if spec.meta.id != case_id {
        bail!(
            "{} declares case.id {}, expected {}",
            case_path.display(),
            spec.meta.id,
            case_id
        );
    }
    Ok(vec![EvalJob { case_path, spec }])
}

/// Show aggregated results for a case.
pub fn report_case(repo_root: &Path, case_id: &str) -> Result<()> {
    let (summary, warnings) = aggregate(&results_root(repo_root).join(case_id))?;
    println!("report: case={} runs={}", case_id, summary.runs);
    println!(
        "report: passed={} failed={} aborted={} error={}",
        summary.passed, summary.failed, summary.aborted, summary.error
    );
    println!(
        "report: matches_expected={}/{}",
        summary.matches_expected, summary.runs
    );
    if summary.bug_reports > 0 {
        println!("report: bug_reports={}", summary.bug_reports);
    }
    if let Some(reward) = summary.mean_reward {
        println!("report: mean_reward={:.3}", reward);
    }
    if let Some(adherence) = summary.mean_plan_adherence {
        println!("report: mean_plan_adherence={:.3}", adherence);
    }
    if let Some(efficiency) = summary.mean_action_efficiency {
        println!("report: mean_action_efficiency={:.3}", efficiency);
    }
    if let Some(avg) = summary.avg_duration_secs {
        println!("report: avg_duration_secs={:.2}", avg);
    }
    for warning in warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}
