//! Parallel execution of independent test cases.
//!
//! Every case gets its own worker thread, its own region draw and its own
//! lifecycle controller. Workers share only the read-only [`DriverContext`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument};

use crate::cancel::CancelToken;
use crate::core::classifier::ErrorClassifier;
use crate::core::module::{ModuleConfig, ModuleSchema};
use crate::core::region::{RegionCandidates, RegionOracle, RegionSelector, StaticRegionOracle};
use crate::core::retry_policy::{RetryOverrides, RetryPolicy};
use crate::core::state::LifecycleState;
use crate::error::{CaseFailure, FailureCause};
use crate::executor::Sleeper;
use crate::exit_codes;
use crate::io::config::HarnessSettings;
use crate::io::environment::EnvironmentInputs;
use crate::io::provisioner::{ProvisionOutputs, Provisioner};
use crate::lifecycle::{AttemptCounts, LifecycleController, RunOutcome};

/// Assertions run against the outputs of a successful apply.
pub type CaseBody = Arc<dyn Fn(&ProvisionOutputs) -> Result<()> + Send + Sync>;

/// One module to provision, check and tear down.
#[derive(Clone)]
pub struct TestCase {
    pub id: String,
    pub module_dir: PathBuf,
    pub schema: ModuleSchema,
    pub vars: BTreeMap<String, Value>,
    pub env: BTreeMap<String, String>,
    pub retry: RetryOverrides,
    pub body: CaseBody,
}

impl TestCase {
    /// A case with no variables whose body accepts any outputs.
    pub fn new(id: impl Into<String>, module_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            module_dir: module_dir.into(),
            schema: ModuleSchema::new(),
            vars: BTreeMap::new(),
            env: BTreeMap::new(),
            retry: RetryOverrides::default(),
            body: Arc::new(|_| Ok(())),
        }
    }

    pub fn with_schema(mut self, schema: ModuleSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryOverrides) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_body<F>(mut self, body: F) -> Self
    where
        F: Fn(&ProvisionOutputs) -> Result<()> + Send + Sync + 'static,
    {
        self.body = Arc::new(body);
        self
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("id", &self.id)
            .field("module_dir", &self.module_dir)
            .field("vars", &self.vars)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOutcome {
    Pass,
    /// Provisioning, the body or teardown failed.
    Fail,
    /// The case never reached the provisioning tool (region or configuration problem).
    Error,
}

impl fmt::Display for CaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaseOutcome::Pass => "pass",
            CaseOutcome::Fail => "fail",
            CaseOutcome::Error => "error",
        };
        f.write_str(name)
    }
}

/// Result of one case, as printed and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub case_id: String,
    pub module_dir: String,
    pub region: Option<String>,
    pub outcome: CaseOutcome,
    pub primary_cause: Option<String>,
    pub teardown_error: Option<String>,
    pub attempts: AttemptCounts,
    pub states: Vec<LifecycleState>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    pub duration_secs: f64,
}

impl CaseReport {
    fn new(case: &TestCase, region: Option<String>, started: Instant) -> Self {
        Self {
            case_id: case.id.clone(),
            module_dir: case.module_dir.display().to_string(),
            region,
            outcome: CaseOutcome::Pass,
            primary_cause: None,
            teardown_error: None,
            attempts: AttemptCounts::default(),
            states: vec![LifecycleState::NotStarted],
            outputs: BTreeMap::new(),
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }

    /// A case rejected before any provisioning call.
    fn rejected(
        case: &TestCase,
        region: Option<String>,
        cause: FailureCause,
        started: Instant,
    ) -> Self {
        error!(case = %case.id, cause = %cause, "case rejected before provisioning");
        Self {
            outcome: CaseOutcome::Error,
            primary_cause: Some(cause.to_string()),
            ..Self::new(case, region, started)
        }
    }

    fn from_outcome(case: &TestCase, region: String, outcome: RunOutcome, started: Instant) -> Self {
        let mut report = Self::new(case, Some(region), started);
        report.attempts = outcome.attempts;
        report.states = outcome.history.states().to_vec();
        report.outputs = outcome.outputs.unwrap_or_default();
        if let Some(CaseFailure { primary, teardown }) = outcome.failure {
            report.outcome = CaseOutcome::Fail;
            report.primary_cause = Some(primary.to_string());
            report.teardown_error = teardown.map(|err| err.to_string());
        }
        report
    }

    fn worker_panicked(case: &TestCase) -> Self {
        Self {
            outcome: CaseOutcome::Fail,
            primary_cause: Some("case worker panicked".to_string()),
            ..Self::new(case, None, Instant::now())
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == CaseOutcome::Pass
    }
}

/// Read-only state shared by every case worker.
pub struct DriverContext<'a, P: Provisioner + ?Sized, S: Sleeper + ?Sized, O = StaticRegionOracle> {
    pub candidates: RegionCandidates,
    pub selector: RegionSelector<O>,
    /// Environment variable the selected region is exported under.
    pub region_env_var: String,
    pub environment: EnvironmentInputs,
    pub policy: RetryPolicy,
    pub classifier: ErrorClassifier,
    pub provisioner: &'a P,
    pub sleeper: &'a S,
    pub cancel: Option<CancelToken>,
}

impl<'a, P, S> DriverContext<'a, P, S, StaticRegionOracle>
where
    P: Provisioner + ?Sized,
    S: Sleeper + ?Sized,
{
    pub fn from_settings(
        settings: &HarnessSettings,
        environment: EnvironmentInputs,
        provisioner: &'a P,
        sleeper: &'a S,
    ) -> Result<Self> {
        let selector = RegionSelector::new(settings.oracle())
            .with_forced(environment.forced_region().map(str::to_string));
        Ok(Self {
            candidates: settings.candidates(),
            selector,
            region_env_var: settings.region_env_var.clone(),
            environment,
            policy: settings.retry_policy(),
            classifier: settings.classifier()?,
            provisioner,
            sleeper,
            cancel: None,
        })
    }
}

impl<P, S, O> DriverContext<'_, P, S, O>
where
    P: Provisioner + ?Sized,
    S: Sleeper + ?Sized,
    O: RegionOracle + Sync,
{
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Environment precedence: captured inputs, then the case's own env, then the region.
    pub fn module_config(&self, case: &TestCase, region: &str) -> Result<ModuleConfig, FailureCause> {
        let config = ModuleConfig::builder(&case.module_dir, case.schema.clone())
            .label(&case.id)
            .vars(case.vars.clone())
            .envs(self.environment.vars().clone())
            .envs(case.env.clone())
            .env(&self.region_env_var, region)
            .retry(case.retry)
            .build()?;
        Ok(config)
    }

    #[instrument(skip_all, fields(case = %case.id))]
    pub fn run_case<R: Rng + ?Sized>(&self, case: &TestCase, rng: &mut R) -> CaseReport {
        let started = Instant::now();
        let region = match self.selector.select(&self.candidates, rng) {
            Ok(region) => region,
            Err(err) => return CaseReport::rejected(case, None, err.into(), started),
        };
        info!(region = %region, "region selected");

        let config = match self.module_config(case, &region) {
            Ok(config) => config,
            Err(cause) => return CaseReport::rejected(case, Some(region), cause, started),
        };

        let mut controller = LifecycleController::new(
            self.provisioner,
            config,
            self.policy,
            &self.classifier,
            self.sleeper,
        );
        if let Some(token) = &self.cancel {
            controller = controller.with_cancel(token);
        }
        let outcome = controller.run_detailed(|outputs| (case.body)(outputs));
        let report = CaseReport::from_outcome(case, region, outcome, started);
        info!(outcome = %report.outcome, duration_secs = report.duration_secs, "case finished");
        report
    }

    /// Run every case concurrently; reports come back in input order.
    #[instrument(skip_all, fields(cases = cases.len()))]
    pub fn run_cases(&self, cases: &[TestCase]) -> Vec<CaseReport> {
        thread::scope(|scope| {
            let handles: Vec<_> = cases
                .iter()
                .map(|case| {
                    let handle = scope.spawn(move || self.run_case(case, &mut rand::thread_rng()));
                    (case, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(case, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        error!(case = %case.id, "case worker panicked");
                        CaseReport::worker_panicked(case)
                    })
                })
                .collect()
        })
    }
}

/// `OK` when every case passed, `FAILED` otherwise.
pub fn exit_code(reports: &[CaseReport]) -> i32 {
    if reports.iter().all(CaseReport::passed) {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    }
}
