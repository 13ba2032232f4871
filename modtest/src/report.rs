//! Aggregation of stored run results.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use harness::driver::CaseOutcome;

use crate::results::{CaseResult, RunMeta, case_results_dir, load_meta};

#[derive(Debug, Default)]
pub struct ReportSummary {
    pub cases: usize,
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub avg_duration_secs: Option<f64>,
    /// Cases whose teardown failed (possible leaked infrastructure).
    pub teardown_failures: Vec<String>,
    pub check_pass_rates: BTreeMap<String, (usize, usize)>,
    pub results: Vec<CaseResult>,
}

/// Run directories under `results_dir`, oldest first.
pub fn load_run_dirs(results_dir: &Path) -> Result<Vec<PathBuf>> {
    if !results_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in
        fs::read_dir(results_dir).with_context(|| format!("read {}", results_dir.display()))?
    {
        let entry = entry.context("read entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Summarize one run directory. Unreadable case files become warnings.
pub fn aggregate(run_dir: &Path) -> Result<(RunMeta, ReportSummary, Vec<String>)> {
    let meta = load_meta(run_dir)?;
    let mut summary = ReportSummary::default();
    let mut warnings = Vec::new();

    let cases_dir = case_results_dir(run_dir);
    let mut paths = Vec::new();
    if cases_dir.exists() {
        for entry in
            fs::read_dir(&cases_dir).with_context(|| format!("read {}", cases_dir.display()))?
        {
            let path = entry.context("read entry")?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
    }
    paths.sort();

    for path in paths {
        let result: CaseResult = match fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))
            .and_then(|contents| serde_json::from_str(&contents).context("parse case result"))
        {
            Ok(result) => result,
            Err(err) => {
                warnings.push(format!("skip {}: {err:#}", path.display()));
                continue;
            }
        };

        summary.cases += 1;
        match result.report.outcome {
            CaseOutcome::Pass => summary.pass += 1,
            CaseOutcome::Fail => summary.fail += 1,
            CaseOutcome::Error => summary.error += 1,
        }
        summary.avg_duration_secs = Some(match summary.avg_duration_secs {
            None => result.report.duration_secs,
            Some(avg) => {
                let total = avg * (summary.cases as f64 - 1.0) + result.report.duration_secs;
                total / summary.cases as f64
            }
        });
        if result.report.teardown_error.is_some()
            || result
                .report
                .primary_cause
                .as_deref()
                .is_some_and(|cause| cause.starts_with("teardown failed"))
        {
            summary.teardown_failures.push(result.report.case_id.clone());
        }
        for check in &result.checks {
            let entry = summary
                .check_pass_rates
                .entry(check.label.clone())
                .or_insert((0, 0));
            if check.passed {
                entry.0 += 1;
            }
            entry.1 += 1;
        }
        summary.results.push(result);
    }

    Ok((meta, summary, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::CheckOutcome;
    use harness::driver::CaseReport;
    use harness::lifecycle::AttemptCounts;
    use tempfile::tempdir;

    fn write_result(dir: &Path, case_id: &str, outcome: CaseOutcome, duration: f64, teardown: bool) {
        let result = CaseResult {
            report: CaseReport {
                case_id: case_id.to_string(),
                module_dir: format!("../{case_id}"),
                region: Some("eu-central-1".to_string()),
                outcome,
                primary_cause: None,
                teardown_error: teardown.then(|| "teardown failed: destroy timed out".to_string()),
                attempts: AttemptCounts::default(),
                states: Vec::new(),
                outputs: BTreeMap::new(),
                duration_secs: duration,
            },
            checks: vec![CheckOutcome {
                label: "output_present(account_alias)".to_string(),
                passed: outcome == CaseOutcome::Pass,
                detail: None,
            }],
        };
        let contents = serde_json::to_string_pretty(&result).expect("json");
        let cases_dir = case_results_dir(dir);
        fs::create_dir_all(&cases_dir).expect("cases dir");
        fs::write(cases_dir.join(format!("{case_id}.json")), contents).expect("write");
    }

    fn write_meta(dir: &Path) {
        let meta = RunMeta {
            run_id: "run-1".to_string(),
            case_hashes: BTreeMap::new(),
            terraform_binary: "terraform".to_string(),
            start_time: "now".to_string(),
            end_time: "later".to_string(),
            duration_secs: 20.0,
            exit_code: 1,
            passed: 1,
            failed: 1,
            errored: 0,
            errors: Vec::new(),
        };
        fs::write(
            dir.join("meta.json"),
            serde_json::to_string_pretty(&meta).expect("json"),
        )
        .expect("write meta");
    }

    #[test]
    fn aggregates_case_results() {
        let temp = tempdir().expect("tempdir");
        write_meta(temp.path());
        write_result(temp.path(), "config", CaseOutcome::Pass, 5.0, false);
        write_result(temp.path(), "iam-users", CaseOutcome::Fail, 15.0, true);
        fs::write(temp.path().join("cases/broken.json"), "{").expect("broken");

        let (meta, summary, warnings) = aggregate(temp.path()).expect("aggregate");

        assert_eq!(meta.run_id, "run-1");
        assert_eq!(warnings.len(), 1);
        assert_eq!(summary.cases, 2);
        assert_eq!(summary.pass, 1);
        assert_eq!(summary.fail, 1);
        assert_eq!(summary.avg_duration_secs, Some(10.0));
        assert_eq!(summary.teardown_failures, vec!["iam-users".to_string()]);
        assert_eq!(
            summary.check_pass_rates.get("output_present(account_alias)"),
            Some(&(1, 2))
        );
    }

    #[test]
    fn case_named_meta_is_kept_apart_from_run_meta() {
        let temp = tempdir().expect("tempdir");
        write_meta(temp.path());
        write_result(temp.path(), "meta", CaseOutcome::Fail, 3.0, false);

        let (meta, summary, warnings) = aggregate(temp.path()).expect("aggregate");

        assert_eq!(meta.run_id, "run-1");
        assert!(warnings.is_empty());
        assert_eq!(summary.cases, 1);
        assert_eq!(summary.fail, 1);
        assert_eq!(summary.results[0].report.case_id, "meta");
    }

    #[test]
    fn missing_results_dir_has_no_runs() {
        let temp = tempdir().expect("tempdir");
        assert!(load_run_dirs(&temp.path().join("absent")).expect("dirs").is_empty());
    }
}
