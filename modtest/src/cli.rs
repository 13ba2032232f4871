//! CLI command implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use harness::cancel::{CancelToken, RunDeadline};
use harness::driver::{CaseReport, DriverContext, exit_code};
use harness::executor::CancellableSleeper;
use harness::exit_codes;
use harness::io::config::{HarnessSettings, load_config, write_config};
use harness::io::environment::EnvironmentInputs;
use harness::io::provisioner::TerraformProvisioner;

use crate::case::{discover_cases, select_cases};
use crate::report::{aggregate, load_run_dirs};
use crate::results::{RunRecord, log_dir, new_run_id, run_dir, validate_run_id, write_run};

/// Conventional exit status for a process stopped by SIGINT.
const INTERRUPTED_EXIT: i32 = 130;

/// Locations shared by every command.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config: PathBuf,
    pub cases_dir: PathBuf,
    pub results_dir: PathBuf,
}

/// Write default settings to `paths.config`.
pub fn init_config(paths: &Paths, force: bool) -> Result<i32> {
    if paths.config.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            paths.config.display()
        );
    }
    write_config(&paths.config, &HarnessSettings::default())?;
    println!("init: wrote {}", paths.config.display());
    Ok(exit_codes::OK)
}

/// List all available cases.
pub fn list_cases(paths: &Paths) -> Result<i32> {
    let cases = discover_cases(&paths.cases_dir)?;
    for case in cases {
        println!("{}\t{}", case.id(), case.module_dir().display());
    }
    Ok(exit_codes::OK)
}

/// Run the selected cases (all when `case_ids` is empty) in parallel.
pub fn run_cases(paths: &Paths, case_ids: &[String], run_id: Option<String>) -> Result<i32> {
    let settings = load_config(&paths.config).context("load settings")?;
    let cases = select_cases(discover_cases(&paths.cases_dir)?, case_ids)?;
    if cases.is_empty() {
        bail!("no cases found in {}", paths.cases_dir.display());
    }
    let run_id = match run_id {
        Some(id) => id,
        None => new_run_id(Utc::now()),
    };
    validate_run_id(&run_id)?;
    if run_dir(&paths.results_dir, &run_id).exists() {
        bail!("results for run {} already exist", run_id);
    }
    debug!(run_id = %run_id, cases = cases.len(), "cases loaded");

    let environment =
        EnvironmentInputs::capture(&settings.passthrough_env, &settings.forced_region_env_var);
    let token = CancelToken::new();
    let interrupts = install_interrupt_handler(&token)?;
    let deadline = RunDeadline::start(token.clone(), settings.run_timeout());
    let provisioner = terraform_provisioner(&settings, deadline.at(), &paths.results_dir, &run_id);
    let ctx = DriverContext::from_settings(&settings, environment, &provisioner, &CancellableSleeper)?
        .with_cancel(token);

    info!(run_id = %run_id, cases = cases.len(), "starting run");
    let test_cases: Vec<_> = cases.iter().map(|case| case.to_test_case()).collect();
    let started_at = Utc::now();
    let reports = ctx.run_cases(&test_cases);
    let finished_at = Utc::now();
    drop(deadline);

    for report in &reports {
        print_case(report);
    }
    let mut code = exit_code(&reports);
    if interrupts.load(Ordering::SeqCst) > 0 {
        warn!(run_id = %run_id, "run was interrupted");
        code = exit_codes::FAILED;
    }
    let dir = write_run(
        &paths.results_dir,
        &RunRecord {
            run_id: &run_id,
            cases: &cases,
            reports: &reports,
            terraform_binary: &settings.terraform.binary,
            exit_code: code,
            started_at,
            finished_at,
        },
    )?;
    let passed = reports.iter().filter(|report| report.passed()).count();
    println!(
        "run: id={} passed={}/{} results={}",
        run_id,
        passed,
        reports.len(),
        dir.display()
    );
    Ok(code)
}

/// Show aggregated results for a stored run (the latest when `run_id` is `None`).
pub fn report_run(paths: &Paths, run_id: Option<&str>) -> Result<i32> {
    let dir = match run_id {
        Some(id) => {
            validate_run_id(id)?;
            run_dir(&paths.results_dir, id)
        }
        None => match load_run_dirs(&paths.results_dir)?.pop() {
            Some(dir) => dir,
            None => bail!("no runs in {}", paths.results_dir.display()),
        },
    };
    if !dir.exists() {
        bail!("run not found at {}", dir.display());
    }
    let (meta, summary, warnings) = aggregate(&dir)?;
    println!("report: run={} cases={}", meta.run_id, summary.cases);
    println!(
        "report: pass={} fail={} error={}",
        summary.pass, summary.fail, summary.error
    );
    if let Some(avg) = summary.avg_duration_secs {
        println!("report: avg_duration_secs={:.2}", avg);
    }
    for result in &summary.results {
        print_case(&result.report);
    }
    for (label, (passed, total)) in &summary.check_pass_rates {
        println!("report: check {} {}/{}", label, passed, total);
    }
    for case_id in &summary.teardown_failures {
        println!("report: teardown failed for {case_id}; check for leftover resources");
    }
    for warning in warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(exit_codes::OK)
}

/// Cancel `token` on SIGINT/SIGTERM so in-flight cases skip to destroy.
///
/// A second signal exits immediately. Returns the number of signals received.
fn install_interrupt_handler(token: &CancelToken) -> Result<Arc<AtomicUsize>> {
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let token = token.clone();
    ctrlc::set_handler(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            warn!("interrupt received; cancelling cases and destroying what was applied");
            token.cancel();
        } else {
            error!("second interrupt; exiting without waiting for destroy");
            std::process::exit(INTERRUPTED_EXIT);
        }
    })
    .context("install interrupt handler")?;
    Ok(received)
}

fn terraform_provisioner(
    settings: &HarnessSettings,
    deadline: std::time::Instant,
    results_dir: &Path,
    run_id: &str,
) -> TerraformProvisioner {
    TerraformProvisioner {
        binary: settings.terraform.binary.clone(),
        command_timeout: settings.command_timeout(),
        destroy_timeout: settings.destroy_timeout(),
        output_limit_bytes: settings.command_output_limit_bytes,
        interrupt_grace: settings.interrupt_grace(),
        deadline: Some(deadline),
        log_dir: Some(log_dir(results_dir, run_id)),
    }
}

fn print_case(report: &CaseReport) {
    println!(
        "case: id={} outcome={} region={} attempts={}/{}/{} duration_secs={:.2}",
        report.case_id,
        report.outcome,
        report.region.as_deref().unwrap_or("-"),
        report.attempts.init,
        report.attempts.apply,
        report.attempts.destroy,
        report.duration_secs
    );
    if let Some(cause) = &report.primary_cause {
        println!("case: id={} cause: {}", report.case_id, cause);
    }
    if let Some(teardown) = &report.teardown_error {
        println!("case: id={} teardown: {}", report.case_id, teardown);
    }
}
