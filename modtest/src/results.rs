//! Result persistence.
//!
//! Each `modtest run` writes `results/<run-id>/` containing `meta.json`
//! describing the run as a whole, one JSON file per case under `cases/`, and
//! the terraform command logs under `logs/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use harness::driver::{CaseOutcome, CaseReport};

use crate::case::LoadedCase;
use crate::checks::{CheckOutcome, evaluate_all};

/// One case as persisted in `cases/<case-id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseResult {
    #[serde(flatten)]
    pub report: CaseReport,
    /// Check verdicts; empty when apply never succeeded.
    #[serde(default)]
    pub checks: Vec<CheckOutcome>,
}

/// Metadata for a run, persisted to `meta.json`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunMeta {
    pub run_id: String,
    /// SHA-256 of each case file, for reproducibility tracking.
    pub case_hashes: BTreeMap<String, String>,
    pub terraform_binary: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub exit_code: i32,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    /// Non-fatal errors encountered while writing results.
    pub errors: Vec<String>,
}

/// Input for persisting a finished run.
#[derive(Debug)]
pub struct RunRecord<'a> {
    pub run_id: &'a str,
    pub cases: &'a [LoadedCase],
    pub reports: &'a [CaseReport],
    pub terraform_binary: &'a Path,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub fn new_run_id(now: DateTime<Utc>) -> String {
    format!("run-{}", now.format("%Y%m%d_%H%M%S_%3f"))
}

pub fn run_dir(base_dir: &Path, run_id: &str) -> PathBuf {
    base_dir.join(run_id)
}

/// Directory holding one `<case-id>.json` per case.
pub fn case_results_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("cases")
}

/// Directory the provisioner appends per-case command logs to.
pub fn log_dir(base_dir: &Path, run_id: &str) -> PathBuf {
    run_dir(base_dir, run_id).join("logs")
}

/// Reject ids that would escape the results directory.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.trim().is_empty() {
        bail!("run id must be non-empty");
    }
    if run_id.contains('/') || run_id.contains('\\') || run_id.contains("..") {
        bail!("run id must not contain path separators or '..'");
    }
    Ok(())
}

/// Write every case result plus `meta.json`. Returns the run directory.
#[instrument(skip_all, fields(run_id = %record.run_id))]
pub fn write_run(base_dir: &Path, record: &RunRecord<'_>) -> Result<PathBuf> {
    let dir = run_dir(base_dir, record.run_id);
    let cases_dir = case_results_dir(&dir);
    fs::create_dir_all(&cases_dir)
        .with_context(|| format!("create results dir {}", cases_dir.display()))?;

    let mut errors = Vec::new();
    let mut case_hashes = BTreeMap::new();
    for case in record.cases {
        match file_sha256(&case.path) {
            Ok(hash) => {
                case_hashes.insert(case.id().to_string(), hash);
            }
            Err(err) => errors.push(format!("case hash {}: {err:#}", case.id())),
        }
    }

    for report in record.reports {
        let checks = record
            .cases
            .iter()
            .find(|case| case.id() == report.case_id)
            .filter(|_| reached_apply(report))
            .map(|case| evaluate_all(&case.file.checks, &report.outputs))
            .unwrap_or_default();
        let result = CaseResult {
            report: report.clone(),
            checks,
        };
        write_json(&cases_dir.join(format!("{}.json", report.case_id)), &result)?;
    }

    if !errors.is_empty() {
        warn!(errors = ?errors, "result capture had errors");
    }

    let count = |outcome: CaseOutcome| {
        record
            .reports
            .iter()
            .filter(|report| report.outcome == outcome)
            .count()
    };
    let duration = record.finished_at - record.started_at;
    let meta = RunMeta {
        run_id: record.run_id.to_string(),
        case_hashes,
        terraform_binary: record.terraform_binary.display().to_string(),
        start_time: record.started_at.to_rfc3339(),
        end_time: record.finished_at.to_rfc3339(),
        duration_secs: duration.num_milliseconds() as f64 / 1000.0,
        exit_code: record.exit_code,
        passed: count(CaseOutcome::Pass),
        failed: count(CaseOutcome::Fail),
        errored: count(CaseOutcome::Error),
        errors,
    };
    write_json(&dir.join("meta.json"), &meta)?;
    debug!(results_dir = %dir.display(), "results written");
    Ok(dir)
}

pub fn load_meta(run_dir: &Path) -> Result<RunMeta> {
    let path = run_dir.join("meta.json");
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn reached_apply(report: &CaseReport) -> bool {
    report
        .states
        .contains(&harness::core::state::LifecycleState::Applied)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value).context("serialize json")?;
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    let digest = hasher.finalize();
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::CaseFile;
    use harness::core::state::LifecycleState;
    use harness::lifecycle::AttemptCounts;
    use serde_json::json;
    use tempfile::tempdir;

    fn report(case_id: &str, outcome: CaseOutcome, states: Vec<LifecycleState>) -> CaseReport {
        CaseReport {
            case_id: case_id.to_string(),
            module_dir: format!("../{case_id}"),
            region: Some("eu-central-1".to_string()),
            outcome,
            primary_cause: None,
            teardown_error: None,
            attempts: AttemptCounts {
                init: 1,
                apply: 1,
                destroy: 1,
            },
            states,
            outputs: BTreeMap::from([("account_alias".to_string(), json!("test-account"))]),
            duration_secs: 1.5,
        }
    }

    #[test]
    fn run_ids_are_stable_prefix_and_safe() {
        let id = new_run_id(Utc::now());
        assert!(id.starts_with("run-"));
        validate_run_id(&id).expect("valid");
        validate_run_id("../escape").expect_err("traversal");
    }

    #[test]
    fn writes_case_results_and_meta() {
        let temp = tempdir().expect("tempdir");
        let case_path = temp.path().join("iam-users.toml");
        fs::write(
            &case_path,
            "[case]\nid = \"iam-users\"\nmodule_dir = \"../iam-users\"\n\n[[checks]]\ntype = \"output_present\"\nname = \"account_alias\"\n",
        )
        .expect("case");
        let cases = vec![LoadedCase {
            file: CaseFile::load(&case_path).expect("load"),
            path: case_path,
        }];
        let reports = vec![report(
            "iam-users",
            CaseOutcome::Pass,
            vec![
                LifecycleState::NotStarted,
                LifecycleState::Initialized,
                LifecycleState::Applied,
                LifecycleState::TornDown,
            ],
        )];
        let now = Utc::now();
        let record = RunRecord {
            run_id: "run-1",
            cases: &cases,
            reports: &reports,
            terraform_binary: Path::new("terraform"),
            exit_code: 0,
            started_at: now,
            finished_at: now,
        };

        let dir = write_run(&temp.path().join("results"), &record).expect("write");

        let meta = load_meta(&dir).expect("meta");
        assert_eq!(meta.passed, 1);
        assert_eq!(meta.case_hashes["iam-users"].len(), 64);
        let result: CaseResult = serde_json::from_str(
            &fs::read_to_string(dir.join("cases/iam-users.json")).expect("read"),
        )
        .expect("parse");
        assert_eq!(result.report, reports[0]);
        assert_eq!(result.checks.len(), 1);
        assert!(result.checks[0].passed);
    }

    #[test]
    fn checks_skipped_when_apply_never_succeeded() {
        let failed = report(
            "iam-users",
            CaseOutcome::Fail,
            vec![
                LifecycleState::NotStarted,
                LifecycleState::Failed,
                LifecycleState::TornDown,
            ],
        );
        assert!(!reached_apply(&failed));
    }
}
