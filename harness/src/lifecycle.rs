//! Init → apply → body → destroy for one module under test.
//!
//! The [`TeardownGuard`] is armed before anything touches the provisioning tool,
//! so destroy runs on every exit path: success, a failed init or apply, a
//! failing or panicking body, and unwinding out of the provisioner itself.
//! Destroy is retried like any other operation but never cancelled.

use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::ErrorClassifier;
use crate::core::module::ModuleConfig;
use crate::core::retry_policy::RetryPolicy;
use crate::core::state::{LifecycleState, StateHistory};
use crate::error::{CaseFailure, FailureCause, FatalProvisioningError, Operation, TeardownError};
use crate::executor::{Attempted, RetryExecutor, Sleeper};
use crate::io::provisioner::{ProvisionOutputs, Provisioner};

/// Attempts spent per operation (0 when the operation never ran).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounts {
    pub init: u32,
    pub apply: u32,
    pub destroy: u32,
}

impl AttemptCounts {
    fn record(&mut self, operation: Operation, attempts: u32) {
        match operation {
            Operation::Init => self.init = attempts,
            Operation::Apply => self.apply = attempts,
            Operation::Destroy => self.destroy = attempts,
        }
    }
}

/// A run that passed.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub history: StateHistory,
    pub outputs: ProvisionOutputs,
    pub attempts: AttemptCounts,
}

/// Everything a run produced, pass or fail.
#[derive(Debug)]
pub struct RunOutcome {
    pub history: StateHistory,
    /// Present once apply succeeded.
    pub outputs: Option<ProvisionOutputs>,
    pub attempts: AttemptCounts,
    pub failure: Option<CaseFailure>,
}

impl RunOutcome {
    pub fn into_result(self) -> Result<RunSummary, CaseFailure> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(RunSummary {
                history: self.history,
                outputs: self.outputs.unwrap_or_default(),
                attempts: self.attempts,
            }),
        }
    }
}

/// Runs destroy exactly once: explicitly through [`teardown`](Self::teardown),
/// or from `Drop` if the owner unwinds before getting there.
pub struct TeardownGuard<'g, P: Provisioner + ?Sized, S: Sleeper + ?Sized> {
    provisioner: &'g P,
    config: &'g ModuleConfig,
    executor: RetryExecutor<'g, S>,
    armed: bool,
}

impl<'g, P: Provisioner + ?Sized, S: Sleeper + ?Sized> TeardownGuard<'g, P, S> {
    pub fn arm(
        provisioner: &'g P,
        config: &'g ModuleConfig,
        policy: RetryPolicy,
        classifier: &'g ErrorClassifier,
        sleeper: &'g S,
    ) -> Self {
        Self {
            provisioner,
            config,
            executor: RetryExecutor::new(policy, classifier, sleeper),
            armed: true,
        }
    }

    pub fn teardown(mut self) -> Result<Attempted<()>, TeardownError> {
        self.armed = false;
        self.destroy()
            .map_err(|source| TeardownError { source })
    }

    fn destroy(&self) -> Result<Attempted<()>, FatalProvisioningError> {
        self.executor
            .execute(Operation::Destroy, || self.provisioner.destroy(self.config))
    }
}

impl<P: Provisioner + ?Sized, S: Sleeper + ?Sized> Drop for TeardownGuard<'_, P, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        warn!(module = %self.config.label(), "tearing down during unwind");
        if let Err(err) = self.destroy() {
            error!(module = %self.config.label(), err = %err, "teardown during unwind failed; resources may be left behind");
        }
    }
}

/// Owns one module configuration for exactly one lifecycle run.
pub struct LifecycleController<'a, P: Provisioner + ?Sized, S: Sleeper + ?Sized> {
    provisioner: &'a P,
    config: ModuleConfig,
    policy: RetryPolicy,
    classifier: &'a ErrorClassifier,
    sleeper: &'a S,
    cancel: Option<&'a CancelToken>,
}

impl<'a, P: Provisioner + ?Sized, S: Sleeper + ?Sized> LifecycleController<'a, P, S> {
    /// `policy` is the run-wide default; the config's own retry overrides win.
    pub fn new(
        provisioner: &'a P,
        config: ModuleConfig,
        policy: RetryPolicy,
        classifier: &'a ErrorClassifier,
        sleeper: &'a S,
    ) -> Self {
        let policy = policy.with_overrides(config.retry());
        Self {
            provisioner,
            config,
            policy,
            classifier,
            sleeper,
            cancel: None,
        }
    }

    /// Stop init/apply retries once `token` fires. Destroy still runs.
    pub fn with_cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn run<F>(self, body: F) -> Result<RunSummary, CaseFailure>
    where
        F: FnOnce(&ProvisionOutputs) -> anyhow::Result<()>,
    {
        self.run_detailed(body).into_result()
    }

    #[instrument(skip_all, fields(module = %self.config.label()))]
    pub fn run_detailed<F>(self, body: F) -> RunOutcome
    where
        F: FnOnce(&ProvisionOutputs) -> anyhow::Result<()>,
    {
        let mut history = StateHistory::default();
        let mut attempts = AttemptCounts::default();

        let guard = TeardownGuard::arm(
            self.provisioner,
            &self.config,
            self.policy,
            self.classifier,
            self.sleeper,
        );
        let (outputs, primary) = self.provision_and_test(&mut history, &mut attempts, body);
        if primary.is_some() {
            transition(&mut history, LifecycleState::Failed);
        }

        let teardown = match guard.teardown() {
            Ok(done) => {
                attempts.record(Operation::Destroy, done.attempts);
                None
            }
            Err(err) => {
                attempts.record(Operation::Destroy, err.source.attempts());
                error!(err = %err, "destroy failed; resources may be left behind");
                Some(err)
            }
        };
        transition(&mut history, LifecycleState::TornDown);

        let failure = CaseFailure::from_parts(primary, teardown);
        match &failure {
            Some(failure) => warn!(failure = %failure, "lifecycle failed"),
            None => info!("lifecycle passed"),
        }
        RunOutcome {
            history,
            outputs,
            attempts,
            failure,
        }
    }

    fn provision_and_test<F>(
        &self,
        history: &mut StateHistory,
        attempts: &mut AttemptCounts,
        body: F,
    ) -> (Option<ProvisionOutputs>, Option<FailureCause>)
    where
        F: FnOnce(&ProvisionOutputs) -> anyhow::Result<()>,
    {
        let mut executor = RetryExecutor::new(self.policy, self.classifier, self.sleeper);
        if let Some(token) = self.cancel {
            executor = executor.with_cancel(token);
        }

        match executor.execute(Operation::Init, || self.provisioner.init(&self.config)) {
            Ok(done) => {
                attempts.record(Operation::Init, done.attempts);
                transition(history, LifecycleState::Initialized);
            }
            Err(err) => {
                attempts.record(Operation::Init, err.attempts());
                return (None, Some(err.into()));
            }
        }

        let outputs = match executor.execute(Operation::Apply, || self.provisioner.apply(&self.config)) {
            Ok(done) => {
                attempts.record(Operation::Apply, done.attempts);
                transition(history, LifecycleState::Applied);
                done.value
            }
            Err(err) => {
                attempts.record(Operation::Apply, err.attempts());
                return (None, Some(err.into()));
            }
        };

        info!(outputs = outputs.len(), "running test body");
        let cause = match panic::catch_unwind(AssertUnwindSafe(|| body(&outputs))) {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(FailureCause::TestBody(err)),
            Err(payload) => Some(FailureCause::Panicked(panic_message(payload.as_ref()))),
        };
        (Some(outputs), cause)
    }
}

fn transition(history: &mut StateHistory, to: LifecycleState) {
    if let Err(err) = history.advance(to) {
        error!(err = %err, "lifecycle transition rejected");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
