//! Lifecycle state machine for one module under test.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a single lifecycle run currently stands.
///
/// `NotStarted → Initialized → Applied → TornDown`, with `Failed` reachable from
/// any non-terminal state. A failed run still proceeds to `TornDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Initialized,
    Applied,
    Failed,
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        self == LifecycleState::TornDown
    }

    /// Validate and perform a transition.
    pub fn advance(self, to: LifecycleState) -> Result<LifecycleState, InvalidTransition> {
        use LifecycleState::{Applied, Failed, Initialized, NotStarted, TornDown};

        let allowed = match (self, to) {
            (NotStarted, Initialized) | (Initialized, Applied) => true,
            (from, Failed) => !from.is_terminal() && from != Failed,
            (from, TornDown) => !from.is_terminal(),
            _ => false,
        };
        if allowed {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

/// Ordered record of every state a run passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHistory {
    states: Vec<LifecycleState>,
}

impl Default for StateHistory {
    fn default() -> Self {
        Self {
            states: vec![LifecycleState::NotStarted],
        }
    }
}

impl StateHistory {
    pub fn current(&self) -> LifecycleState {
        self.states
            .last()
            .copied()
            .unwrap_or(LifecycleState::NotStarted)
    }

    pub fn advance(&mut self, to: LifecycleState) -> Result<(), InvalidTransition> {
        let next = self.current().advance(to)?;
        self.states.push(next);
        Ok(())
    }

    pub fn states(&self) -> &[LifecycleState] {
        &self.states
    }

    pub fn torn_down_count(&self) -> usize {
        self.states
            .iter()
            .filter(|state| **state == LifecycleState::TornDown)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::{Applied, Failed, Initialized, NotStarted, TornDown};
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut history = StateHistory::default();
        history.advance(Initialized).expect("init");
        history.advance(Applied).expect("apply");
        history.advance(TornDown).expect("teardown");
        assert_eq!(
            history.states(),
            &[NotStarted, Initialized, Applied, TornDown]
        );
    }

    #[test]
    fn failure_is_reachable_from_every_non_terminal_state() {
        for state in [NotStarted, Initialized, Applied] {
            assert_eq!(state.advance(Failed), Ok(Failed));
        }
        assert!(TornDown.advance(Failed).is_err());
    }

    #[test]
    fn failed_run_still_tears_down() {
        assert_eq!(Failed.advance(TornDown), Ok(TornDown));
    }

    #[test]
    fn torn_down_is_terminal() {
        let mut history = StateHistory::default();
        history.advance(TornDown).expect("teardown");
        assert!(history.advance(TornDown).is_err());
        assert_eq!(history.torn_down_count(), 1);
    }

    #[test]
    fn steps_cannot_be_skipped_or_reordered() {
        assert!(NotStarted.advance(Applied).is_err());
        assert!(Applied.advance(Initialized).is_err());
        assert!(Failed.advance(Applied).is_err());
    }
}
