//! Command-line front end for the module test harness.
//!
//! Reads case files from `cases/`, provisions each module in parallel through
//! `harness::driver`, and records results under `results/<run-id>/`.

mod case;
mod checks;
mod cli;
mod report;
mod results;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use harness::exit_codes;

use crate::cli::Paths;

#[derive(Parser)]
#[command(
    name = "modtest",
    version,
    about = "Provision, check and tear down infrastructure modules"
)]
struct Cli {
    /// Harness settings file (defaults apply when missing).
    #[arg(long, global = true, default_value = "modtest.toml")]
    config: PathBuf,
    #[arg(long, global = true, default_value = "cases")]
    cases_dir: PathBuf,
    #[arg(long, global = true, default_value = "results")]
    results_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a settings file with every default spelled out.
    Init {
        /// Replace an existing settings file.
        #[arg(long)]
        force: bool,
    },
    /// Print every case id and its module directory.
    List,
    /// Run cases in parallel (all of them unless ids are given).
    Run {
        case_ids: Vec<String>,
        /// Name the results directory instead of using a timestamp.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Summarize a stored run (the latest one by default).
    Report { run_id: Option<String> },
}

fn main() {
    harness::logging::init("info");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::try_parse().map_err(|err| {
        // --help and --version are not errors.
        if !err.use_stderr() {
            let _ = err.print();
            std::process::exit(exit_codes::OK);
        }
        anyhow::anyhow!("{err}")
    })?;
    let paths = Paths {
        config: cli.config,
        cases_dir: cli.cases_dir,
        results_dir: cli.results_dir,
    };
    match cli.command {
        Command::Init { force } => cli::init_config(&paths, force),
        Command::List => cli::list_cases(&paths),
        Command::Run { case_ids, run_id } => cli::run_cases(&paths, &case_ids, run_id),
        Command::Report { run_id } => cli::report_run(&paths, run_id.as_deref()),
    }
}
