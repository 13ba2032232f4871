//! Output checks declared in case files.
//!
//! Checks run as the test body, against the outputs of a successful apply.
//! The same evaluation is repeated when writing results so every check's
//! verdict is recorded.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use harness::driver::CaseBody;
use harness::io::provisioner::ProvisionOutputs;

/// Verification run against module outputs.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    /// The output exists and is not null.
    OutputPresent { name: String },
    /// The output equals `value` exactly.
    OutputEquals { name: String, value: Value },
}

/// Result of evaluating a single check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckOutcome {
    pub label: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Check {
    pub fn validate(&self) -> Result<()> {
        let name = match self {
            Check::OutputPresent { name } | Check::OutputEquals { name, .. } => name,
        };
        if name.trim().is_empty() {
            bail!("check output name must be non-empty");
        }
        Ok(())
    }

    pub fn label(&self) -> String {
        match self {
            Check::OutputPresent { name } => format!("output_present({name})"),
            Check::OutputEquals { name, value } => format!("output_equals({name}={value})"),
        }
    }

    pub fn evaluate(&self, outputs: &ProvisionOutputs) -> CheckOutcome {
        let detail = match self {
            Check::OutputPresent { name } => match outputs.get(name) {
                Some(value) if !value.is_null() => None,
                Some(_) => Some(format!("output {name} is null")),
                None => Some(format!("output {name} missing")),
            },
            Check::OutputEquals { name, value } => match outputs.get(name) {
                Some(actual) if actual == value => None,
                Some(actual) => Some(format!("output {name} is {actual}, expected {value}")),
                None => Some(format!("output {name} missing")),
            },
        };
        let outcome = CheckOutcome {
            label: self.label(),
            passed: detail.is_none(),
            detail,
        };
        debug!(check = %outcome.label, passed = outcome.passed, "check result");
        outcome
    }
}

pub fn evaluate_all(checks: &[Check], outputs: &ProvisionOutputs) -> Vec<CheckOutcome> {
    checks.iter().map(|check| check.evaluate(outputs)).collect()
}

/// Test body failing with every unmet check when any check fails.
pub fn case_body(checks: Vec<Check>) -> CaseBody {
    std::sync::Arc::new(move |outputs: &ProvisionOutputs| {
        let failures: Vec<String> = evaluate_all(&checks, outputs)
            .into_iter()
            .filter_map(|outcome| outcome.detail)
            .collect();
        if !failures.is_empty() {
            bail!("{}", failures.join("; "));
        }
        Ok(())
    })
}
