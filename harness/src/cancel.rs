//! Run-wide cancellation shared by every case worker.
//!
//! Cancellation stops retries and new init/apply attempts. It never stops a
//! destroy: teardown ignores the token entirely.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Default)]
struct Flag {
    cancelled: Mutex<bool>,
    changed: Condvar,
}

/// Cloneable handle to a shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Flag>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        *self.lock() = true;
        self.inner.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.lock()
    }

    /// Block for up to `timeout`. Returns `true` if cancelled before or during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.lock();
        while !*cancelled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            cancelled = match self.inner.changed.wait_timeout(cancelled, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // A poisoned flag still holds a valid bool.
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Watchdog that cancels `token` once the run exceeds its time budget.
///
/// Dropping the deadline stops the watchdog without cancelling anything.
#[derive(Debug)]
pub struct RunDeadline {
    at: Instant,
    finished: CancelToken,
    watchdog: Option<JoinHandle<()>>,
}

impl RunDeadline {
    pub fn start(token: CancelToken, budget: Duration) -> Self {
        let at = Instant::now() + budget;
        let finished = CancelToken::new();
        let finished_signal = finished.clone();
        let watchdog = thread::spawn(move || {
            if !finished_signal.wait_timeout(budget) {
                warn!(
                    budget_secs = budget.as_secs(),
                    "run deadline reached, cancelling in-flight cases"
                );
                token.cancel();
            }
        });
        Self {
            at,
            finished,
            watchdog: Some(watchdog),
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }
}

impl Drop for RunDeadline {
    fn drop(&mut self) {
        self.finished.cancel();
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.join();
        }
    }
}
