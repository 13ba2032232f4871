//! Scripted collaborators for exercising lifecycles without a cloud account.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::core::module::ModuleConfig;
use crate::error::{Operation, OperationFailure};
use crate::executor::Sleeper;
use crate::io::provisioner::{ProvisionOutputs, Provisioner};

/// One call observed by [`ScriptedProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionCall {
    pub operation: Operation,
    pub label: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: BTreeMap<Operation, VecDeque<Result<(), OperationFailure>>>,
    calls: Vec<ProvisionCall>,
    live: BTreeSet<String>,
    creates: usize,
    updates: usize,
}

/// Provisioner that replays queued results per operation.
///
/// Once an operation's queue is empty every further call succeeds. Successful
/// applies are counted as a create the first time a label goes live and as an
/// update afterwards; a successful destroy takes the label down again.
#[derive(Debug, Default)]
pub struct ScriptedProvisioner {
    outputs: ProvisionOutputs,
    cancel_after: Option<(Operation, CancelToken)>,
    state: Mutex<ScriptState>,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs returned by every successful apply.
    pub fn with_outputs(mut self, outputs: ProvisionOutputs) -> Self {
        self.outputs = outputs;
        self
    }

    /// Queue results for `operation`, consumed one per call.
    pub fn script<I>(self, operation: Operation, results: I) -> Self
    where
        I: IntoIterator<Item = Result<(), OperationFailure>>,
    {
        self.lock()
            .scripts
            .entry(operation)
            .or_default()
            .extend(results);
        self
    }

    /// Cancel `token` right after the first call to `operation` returns.
    pub fn cancel_after(mut self, operation: Operation, token: CancelToken) -> Self {
        self.cancel_after = Some((operation, token));
        self
    }

    pub fn calls(&self) -> Vec<ProvisionCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    pub fn count_for(&self, label: &str, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation && call.label == label)
            .count()
    }

    pub fn creates(&self) -> usize {
        self.lock().creates
    }

    pub fn updates(&self) -> usize {
        self.lock().updates
    }

    /// Labels applied and not yet destroyed.
    pub fn live(&self) -> Vec<String> {
        self.lock().live.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn call(&self, operation: Operation, config: &ModuleConfig) -> Result<(), OperationFailure> {
        let result = {
            let mut state = self.lock();
            state.calls.push(ProvisionCall {
                operation,
                label: config.label().to_string(),
                env: config.env().clone(),
            });
            let result = state
                .scripts
                .get_mut(&operation)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(()));
            if result.is_ok() {
                let label = config.label().to_string();
                match operation {
                    Operation::Init => {}
                    Operation::Apply => {
                        if state.live.insert(label) {
                            state.creates += 1;
                        } else {
                            state.updates += 1;
                        }
                    }
                    Operation::Destroy => {
                        state.live.remove(&label);
                    }
                }
            }
            result
        };
        if let Some((trigger, token)) = &self.cancel_after
            && *trigger == operation
        {
            token.cancel();
        }
        result
    }
}

impl Provisioner for ScriptedProvisioner {
    fn init(&self, config: &ModuleConfig) -> Result<(), OperationFailure> {
        self.call(Operation::Init, config)
    }

    fn apply(&self, config: &ModuleConfig) -> Result<ProvisionOutputs, OperationFailure> {
        self.call(Operation::Apply, config)
            .map(|()| self.outputs.clone())
    }

    fn destroy(&self, config: &ModuleConfig) -> Result<(), OperationFailure> {
        self.call(Operation::Destroy, config)
    }
}

/// Failure text the default classifier treats as throttling.
pub fn throttled(operation: Operation) -> OperationFailure {
    OperationFailure::new(
        operation,
        Some(1),
        "Error: ThrottlingException: Rate exceeded\n\tstatus code: 400",
    )
}

/// Failure text no default pattern matches.
pub fn denied(operation: Operation) -> OperationFailure {
    OperationFailure::new(
        operation,
        Some(1),
        "Error: AccessDenied: User is not authorized to perform iam:CreateUser",
    )
}

/// Sleeper that records requested delays instead of waiting.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
    cancels: Option<CancelToken>,
}

impl RecordingSleeper {
    /// Cancel `token` on the first sleep and report the wait as interrupted.
    pub fn cancelling(token: CancelToken) -> Self {
        Self {
            delays: Mutex::new(Vec::new()),
            cancels: Some(token),
        }
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration, cancel: Option<&CancelToken>) -> bool {
        self.delays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(delay);
        if let Some(token) = &self.cancels {
            token.cancel();
            return false;
        }
        !cancel.is_some_and(CancelToken::is_cancelled)
    }
}
