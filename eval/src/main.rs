mod cli;
mod outcome;
mod report;
mod results;
mod run;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::cli::RunArgs;

#[derive(Parser)]
#[command(name = "qa-eval", version, about = "Evaluation harness for qa-runner cases")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List cases under eval/cases.
    List,
    /// Run one case, or every case with `all`.
    Run {
        case_id: String,
        #[arg(long, default_value_t = 1)]
        runs: u32,
        /// Device serial; repeat to run one worker per device.
        #[arg(long = "serial")]
        serials: Vec<String>,
        #[arg(long, default_value = "qa-runner.toml")]
        config: PathBuf,
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Aggregate results for a case.
    Report { case_id: String },
}

fn main() -> Result<()> {
    qa_runner::logging::init();
    let cli = Cli::parse();
    let repo_root = std::env::current_dir()?;
    match cli.command {
        Command::List => cli::list_cases(&repo_root),
        Command::Run {
            case_id,
            runs,
            serials,
            config,
            deadline_secs,
        } => {
            let args = RunArgs {
                case_id,
                runs,
                serials,
                config,
                deadline_secs,
            };
            if !cli::run_cases(&repo_root, &args)? {
                std::process::exit(qa_runner::exit_codes::FAIL);
            }
            Ok(())
        }
        Command::Report { case_id } => cli::report_case(&repo_root, &case_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_collects_repeated_serials() {
        let cli = Cli::parse_from([
            "qa-eval",
            "run",
            "all",
            "--serial",
            "emulator-5554",
            "--serial",
            "emulator-5556",
        ]);
        let Command::Run {
            case_id,
            runs,
            serials,
            config,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(case_id, "all");
        assert_eq!(runs, 1);
        assert_eq!(serials, vec!["emulator-5554", "emulator-5556"]);
        assert_eq!(config, PathBuf::from("qa-runner.toml"));
    }
}
