//! Shared time budget helpers for bounded provisioning commands.

use std::time::{Duration, Instant};

use thiserror::Error;

/// The overall run deadline has already passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run deadline exceeded")]
pub struct BudgetExhausted;

/// Timeout for the next command: `cap`, shortened to whatever remains before `deadline`.
///
/// Without a deadline the cap is returned unchanged.
pub fn command_budget(deadline: Option<Instant>, cap: Duration) -> Result<Duration, BudgetExhausted> {
    let Some(deadline) = deadline else {
        return Ok(cap);
    };
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(BudgetExhausted);
    }
    Ok(remaining.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_deadline_returns_cap() {
        let cap = Duration::from_secs(30);
        assert_eq!(command_budget(None, cap), Ok(cap));
    }

    #[test]
    fn near_deadline_shortens_budget() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let budget = command_budget(Some(deadline), Duration::from_secs(600)).expect("budget");
        assert!(budget <= Duration::from_secs(5));
    }

    #[test]
    fn past_deadline_is_exhausted() {
        let deadline = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
        assert_eq!(
            command_budget(Some(deadline), Duration::from_secs(1)),
            Err(BudgetExhausted)
        );
    }
}
