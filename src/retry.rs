use crate::types::StageResult;
use std::fmt;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Per-stage state of a case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Fresh,
    /// Failed transiently this many times
    Retry(u32),
    Processed,
    Pending,
}

impl RetryState {
    /// Processed and Pending are only left by an operator requeue
    pub fn is_terminal(self) -> bool {
        matches!(self, RetryState::Processed | RetryState::Pending)
    }

    /// State for a case with `attempts` recorded failures
    pub fn from_attempts(attempts: u32) -> Self {
        match attempts {
            0 => RetryState::Fresh,
            n => RetryState::Retry(n),
        }
    }

    pub fn attempts(self) -> u32 {
        match self {
            RetryState::Retry(n) => n,
            _ => 0,
        }
    }
}

impl fmt::Display for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryState::Fresh => write!(f, "fresh"),
            RetryState::Retry(n) => write!(f, "retry({})", n),
            RetryState::Processed => write!(f, "processed"),
            RetryState::Pending => write!(f, "pending"),
        }
    }
}

/// Bounded retries for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Next state after running the stage once from `from`.
    ///
    /// The failure count is compared after incrementing, so a case is tried
    /// exactly `max_attempts` times before it lands in Pending.
    pub fn transition(&self, from: RetryState, result: &StageResult) -> RetryState {
        if from.is_terminal() {
            return from;
        }
        match result {
            StageResult::Success(_) => RetryState::Processed,
            StageResult::TerminalFailure(_) => RetryState::Pending,
            StageResult::TransientFailure(_) => {
                let attempts = from.attempts() + 1;
                if attempts >= self.max_attempts {
                    RetryState::Pending
                } else {
                    RetryState::Retry(attempts)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> StageResult {
        StageResult::TransientFailure("timeout".to_string())
    }

    #[test]
    fn test_success_from_any_open_state() {
        let policy = RetryPolicy::default();
        let ok = StageResult::Success(None);
        assert_eq!(policy.transition(RetryState::Fresh, &ok), RetryState::Processed);
        assert_eq!(policy.transition(RetryState::Retry(2), &ok), RetryState::Processed);
    }

    #[test]
    fn test_transient_walks_to_pending() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::Fresh;
        let mut runs = 0;
        while !state.is_terminal() {
            state = policy.transition(state, &transient());
            runs += 1;
        }
        assert_eq!(state, RetryState::Pending);
        assert_eq!(runs, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_transient_below_bound_retries() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.transition(RetryState::Fresh, &transient()), RetryState::Retry(1));
        assert_eq!(
            policy.transition(RetryState::Retry(1), &transient()),
            RetryState::Retry(2)
        );
        assert_eq!(
            policy.transition(RetryState::Retry(2), &transient()),
            RetryState::Pending
        );
    }

    #[test]
    fn test_terminal_failure_skips_retries() {
        let policy = RetryPolicy::new(5);
        let terminal = StageResult::TerminalFailure("missing credential".to_string());
        assert_eq!(policy.transition(RetryState::Fresh, &terminal), RetryState::Pending);
        assert_eq!(policy.transition(RetryState::Retry(1), &terminal), RetryState::Pending);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let policy = RetryPolicy::default();
        let ok = StageResult::Success(None);
        assert_eq!(policy.transition(RetryState::Pending, &ok), RetryState::Pending);
        assert_eq!(
            policy.transition(RetryState::Processed, &transient()),
            RetryState::Processed
        );
    }

    #[test]
    fn test_single_attempt_policy() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.transition(RetryState::Fresh, &transient()), RetryState::Pending);
    }
}
