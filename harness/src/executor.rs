//! Retry sequencing for provisioning operations.
//!
//! [`RetryExecutor`] runs one operation until it succeeds, fails with an error
//! the [`ErrorClassifier`] does not recognize as transient, runs out of
//! attempts, or the run is cancelled. Idempotence of repeated applies is the
//! provisioning tool's job; this module only decides whether to try again.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::{Classification, ErrorClassifier};
use crate::core::retry_policy::RetryPolicy;
use crate::error::{FatalProvisioningError, Operation, OperationFailure, TransientProvisioningError};

/// Blocking wait between attempts.
pub trait Sleeper: Sync {
    /// Wait for `delay`. Returns `false` if the wait was cut short by cancellation.
    fn sleep(&self, delay: Duration, cancel: Option<&CancelToken>) -> bool;
}

/// Sleeps on the calling thread, waking early if the run is cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancellableSleeper;

impl Sleeper for CancellableSleeper {
    fn sleep(&self, delay: Duration, cancel: Option<&CancelToken>) -> bool {
        match cancel {
            Some(token) => !token.wait_timeout(delay),
            None => {
                std::thread::sleep(delay);
                true
            }
        }
    }
}

/// Successful result together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Retry loop over a single provisioning operation.
pub struct RetryExecutor<'a, S: Sleeper + ?Sized> {
    policy: RetryPolicy,
    classifier: &'a ErrorClassifier,
    sleeper: &'a S,
    cancel: Option<&'a CancelToken>,
}

impl<'a, S: Sleeper + ?Sized> RetryExecutor<'a, S> {
    pub fn new(policy: RetryPolicy, classifier: &'a ErrorClassifier, sleeper: &'a S) -> Self {
        Self {
            policy,
            classifier,
            sleeper,
            cancel: None,
        }
    }

    /// Stop retrying (and skip further attempts) once `token` is cancelled.
    pub fn with_cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelToken::is_cancelled)
    }

    /// Run `op` until success or a fatal outcome.
    #[instrument(skip_all, fields(%operation, max_attempts = self.policy.max_attempts))]
    pub fn execute<T, F>(
        &self,
        operation: Operation,
        mut op: F,
    ) -> Result<Attempted<T>, FatalProvisioningError>
    where
        F: FnMut() -> Result<T, OperationFailure>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            if self.cancelled() {
                warn!(attempts = attempt, "cancelled before next attempt");
                return Err(FatalProvisioningError::Cancelled {
                    operation,
                    attempts: attempt,
                });
            }

            attempt += 1;
            debug!(attempt, "starting attempt");
            let failure = match op() {
                Ok(value) => {
                    info!(attempts = attempt, "operation succeeded");
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(failure) => failure,
            };

            let reason = match self.classify(&failure) {
                Classification::Transient { reason } => reason,
                Classification::Fatal => {
                    warn!(attempts = attempt, error = %failure, "non-retryable failure");
                    return Err(FatalProvisioningError::NonRetryable {
                        operation,
                        attempts: attempt,
                        summary: failure.summary(),
                        failure,
                    });
                }
            };

            let transient = TransientProvisioningError {
                operation,
                attempt,
                reason,
                failure,
            };
            if attempt >= max_attempts {
                warn!(attempts = attempt, reason = %transient.reason, "retries exhausted");
                return Err(FatalProvisioningError::RetriesExhausted {
                    operation,
                    attempts: attempt,
                    last: transient,
                });
            }

            let delay = self.policy.delay_for(attempt - 1);
            warn!(
                attempt,
                reason = %transient.reason,
                delay_ms = delay.as_millis() as u64,
                "transient failure, retrying"
            );
            if !self.sleeper.sleep(delay, self.cancel) {
                warn!(attempts = attempt, "cancelled during backoff");
                return Err(FatalProvisioningError::Cancelled {
                    operation,
                    attempts: attempt,
                });
            }
        }
    }

    fn classify(&self, failure: &OperationFailure) -> Classification {
        if failure.timed_out {
            return Classification::Fatal;
        }
        self.classifier.classify(&failure.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingSleeper;
    use std::cell::Cell;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }

    fn throttled() -> OperationFailure {
        OperationFailure::new(
            Operation::Apply,
            Some(1),
            "Error: ThrottlingException: Rate exceeded",
        )
    }

    #[test]
    fn transient_twice_then_success_records_three_attempts() {
        let classifier = ErrorClassifier::default();
        let sleeper = RecordingSleeper::default();
        let executor = RetryExecutor::new(policy(5), &classifier, &sleeper);
        let calls = Cell::new(0);

        let result = executor
            .execute(Operation::Apply, || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(throttled())
                } else {
                    Ok("applied")
                }
            })
            .expect("success");

        assert_eq!(result.value, "applied");
        assert_eq!(result.attempts, 3);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
    }

    #[test]
    fn fatal_failure_is_not_retried() {
        let classifier = ErrorClassifier::default();
        let sleeper = RecordingSleeper::default();
        let executor = RetryExecutor::new(policy(5), &classifier, &sleeper);
        let calls = Cell::new(0);

        let err = executor
            .execute::<(), _>(Operation::Apply, || {
                calls.set(calls.get() + 1);
                Err(OperationFailure::new(
                    Operation::Apply,
                    Some(1),
                    "Error: AccessDenied: not authorized",
                ))
            })
            .expect_err("fatal");

        assert_eq!(calls.get(), 1);
        assert!(sleeper.delays().is_empty());
        assert!(matches!(
            err,
            FatalProvisioningError::NonRetryable { attempts: 1, .. }
        ));
    }

    #[test]
    fn exhaustion_surfaces_single_fatal_error() {
        let classifier = ErrorClassifier::default();
        let sleeper = RecordingSleeper::default();
        let executor = RetryExecutor::new(policy(3), &classifier, &sleeper);
        let calls = Cell::new(0);

        let err = executor
            .execute::<(), _>(Operation::Apply, || {
                calls.set(calls.get() + 1);
                Err(throttled())
            })
            .expect_err("exhausted");

        assert_eq!(calls.get(), 3);
        assert_eq!(sleeper.delays().len(), 2);
        match err {
            FatalProvisioningError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.attempt, 3);
                assert_eq!(last.reason, "API rate limited");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn timed_out_command_is_fatal_even_if_output_looks_transient() {
        let classifier = ErrorClassifier::default();
        let sleeper = RecordingSleeper::default();
        let executor = RetryExecutor::new(policy(3), &classifier, &sleeper);

        let err = executor
            .execute::<(), _>(Operation::Init, || {
                Err(OperationFailure::timed_out(
                    Operation::Init,
                    "Error installing provider",
                ))
            })
            .expect_err("fatal");

        assert_eq!(err.attempts(), 1);
    }

    #[test]
    fn cancelled_token_prevents_first_attempt() {
        let classifier = ErrorClassifier::default();
        let sleeper = RecordingSleeper::default();
        let token = CancelToken::new();
        token.cancel();
        let executor = RetryExecutor::new(policy(3), &classifier, &sleeper).with_cancel(&token);
        let calls = Cell::new(0);

        let err = executor
            .execute(Operation::Apply, || {
                calls.set(calls.get() + 1);
                Ok(())
            })
            .expect_err("cancelled");

        assert_eq!(calls.get(), 0);
        assert!(matches!(
            err,
            FatalProvisioningError::Cancelled { attempts: 0, .. }
        ));
    }

    #[test]
    fn cancellation_during_backoff_stops_retries() {
        let classifier = ErrorClassifier::default();
        let token = CancelToken::new();
        let sleeper = RecordingSleeper::cancelling(token.clone());
        let executor = RetryExecutor::new(policy(5), &classifier, &sleeper).with_cancel(&token);
        let calls = Cell::new(0);

        let err = executor
            .execute::<(), _>(Operation::Apply, || {
                calls.set(calls.get() + 1);
                Err(throttled())
            })
            .expect_err("cancelled");

        assert_eq!(calls.get(), 1);
        assert_eq!(err.attempts(), 1);
    }
}
