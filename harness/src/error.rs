//! Error taxonomy for a lifecycle run.
//!
//! Transient failures never leave the executor on their own: they either turn
//! into a success after a retry or end up as the source of a
//! [`FatalProvisioningError`]. A [`CaseFailure`] always carries exactly one
//! primary cause, with a teardown failure attached alongside when both happen.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::core::module::VarKind;

/// Provisioning operations driven by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Init,
    Apply,
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Init => "init",
            Operation::Apply => "apply",
            Operation::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

/// Raw failure reported by the provisioning tool, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} exited with {}", exit_label(.exit_code, .timed_out))]
pub struct OperationFailure {
    pub operation: Operation,
    pub exit_code: Option<i32>,
    /// Captured stdout and stderr; classification runs on this text.
    pub output: String,
    /// The command was killed after exceeding its time budget.
    pub timed_out: bool,
}

impl OperationFailure {
    pub fn new(operation: Operation, exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            operation,
            exit_code,
            output: output.into(),
            timed_out: false,
        }
    }

    pub fn timed_out(operation: Operation, output: impl Into<String>) -> Self {
        Self {
            operation,
            exit_code: None,
            output: output.into(),
            timed_out: true,
        }
    }

    /// Last non-empty line of output, for one-line reporting.
    pub fn summary(&self) -> String {
        self.output
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.to_string())
    }
}

fn exit_label(exit_code: &Option<i32>, timed_out: &bool) -> String {
    match (exit_code, *timed_out) {
        (_, true) => "timeout".to_string(),
        (Some(code), false) => format!("status {code}"),
        (None, false) => "no status".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no eligible region: allowed={allowed:?} excluded={excluded:?}")]
pub struct NoEligibleRegionError {
    pub allowed: Vec<String>,
    pub excluded: Vec<String>,
}

/// A failure recognized as transient; retried by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} attempt {attempt} failed transiently ({reason})")]
pub struct TransientProvisioningError {
    pub operation: Operation,
    pub attempt: u32,
    pub reason: String,
    #[source]
    pub failure: OperationFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalProvisioningError {
    #[error("{operation} failed after {attempts} attempt(s): {summary}")]
    NonRetryable {
        operation: Operation,
        attempts: u32,
        summary: String,
        #[source]
        failure: OperationFailure,
    },
    #[error("{operation} still failing after {attempts} attempt(s): {}", .last.reason)]
    RetriesExhausted {
        operation: Operation,
        attempts: u32,
        #[source]
        last: TransientProvisioningError,
    },
    #[error("{operation} cancelled after {attempts} attempt(s)")]
    Cancelled { operation: Operation, attempts: u32 },
}

impl FatalProvisioningError {
    pub fn operation(&self) -> Operation {
        match self {
            FatalProvisioningError::NonRetryable { operation, .. }
            | FatalProvisioningError::RetriesExhausted { operation, .. }
            | FatalProvisioningError::Cancelled { operation, .. } => *operation,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            FatalProvisioningError::NonRetryable { attempts, .. }
            | FatalProvisioningError::RetriesExhausted { attempts, .. }
            | FatalProvisioningError::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Destroy did not complete; live infrastructure may remain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("teardown failed: {source}")]
pub struct TeardownError {
    #[source]
    pub source: FatalProvisioningError,
}

/// Module configuration rejected at construction time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("module directory must be non-empty")]
    EmptyModuleDir,
    #[error("variable {name} is not declared by the module")]
    UnknownVariable { name: String },
    #[error("variable {name} expects {expected}, got {found}")]
    KindMismatch {
        name: String,
        expected: VarKind,
        found: Value,
    },
    #[error("required variable {name} is missing")]
    MissingVariable { name: String },
    #[error("environment keys must be non-empty")]
    EmptyEnvKey,
    #[error("{0}")]
    InvalidRetry(String),
}

/// The one reason a case is reported as failed.
#[derive(Debug, Error)]
pub enum FailureCause {
    #[error(transparent)]
    Region(#[from] NoEligibleRegionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provisioning(#[from] FatalProvisioningError),
    #[error("test body failed: {0:#}")]
    TestBody(anyhow::Error),
    #[error("test body panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

/// Primary failure plus an optional teardown failure that happened after it.
#[derive(Debug, Error)]
pub struct CaseFailure {
    pub primary: FailureCause,
    pub teardown: Option<TeardownError>,
}

impl CaseFailure {
    pub fn new(primary: impl Into<FailureCause>) -> Self {
        Self {
            primary: primary.into(),
            teardown: None,
        }
    }

    /// Combine a primary failure with the teardown result. A teardown failure
    /// without an earlier failure becomes the primary cause itself.
    pub fn from_parts(
        primary: Option<FailureCause>,
        teardown: Option<TeardownError>,
    ) -> Option<Self> {
        match (primary, teardown) {
            (Some(primary), teardown) => Some(Self { primary, teardown }),
            (None, Some(teardown)) => Some(Self::new(teardown)),
            (None, None) => None,
        }
    }
}

impl fmt::Display for CaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if let Some(teardown) = &self.teardown {
            write!(f, " (additionally, {teardown})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fatal(operation: Operation) -> FatalProvisioningError {
        FatalProvisioningError::NonRetryable {
            operation,
            attempts: 1,
            summary: "boom".to_string(),
            failure: OperationFailure::new(operation, Some(1), "Error: boom"),
        }
    }

    #[test]
    fn teardown_only_failure_becomes_primary() {
        let failure = CaseFailure::from_parts(
            None,
            Some(TeardownError {
                source: fatal(Operation::Destroy),
            }),
        )
        .expect("failure");
        assert!(matches!(failure.primary, FailureCause::Teardown(_)));
        assert!(failure.teardown.is_none());
    }

    #[test]
    fn apply_failure_stays_primary_when_teardown_also_fails() {
        let failure = CaseFailure::from_parts(
            Some(FailureCause::Provisioning(fatal(Operation::Apply))),
            Some(TeardownError {
                source: fatal(Operation::Destroy),
            }),
        )
        .expect("failure");
        let message = failure.to_string();
        assert!(message.starts_with("apply failed after 1 attempt(s): boom"));
        assert!(message.contains("teardown failed: destroy failed"));
    }

    #[test]
    fn no_failures_yield_none() {
        assert!(CaseFailure::from_parts(None, None).is_none());
    }

    #[test]
    fn failure_summary_uses_last_output_line() {
        let failure = OperationFailure::new(Operation::Apply, Some(1), "planning\nError: denied\n\n");
        assert_eq!(failure.summary(), "Error: denied");
        assert_eq!(
            OperationFailure::timed_out(Operation::Init, "").to_string(),
            "init exited with timeout"
        );
    }
}
