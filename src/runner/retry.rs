//! Retry policy for execution attempts.
//!
//! Only timeouts are retried. A worker error or a finished attempt is never
//! re-run: a rejected output must surface to the caller, not disappear behind
//! a silent second try.

use serde::{Deserialize, Serialize};

use super::ExecutionResult;
use crate::task::FailureReason;

/// What to do with a task after an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptDecision {
    /// The attempt produced output; validate and complete
    Complete,
    /// Queue the task again
    Retry,
    /// Stop; the task fails with this reason (after its verdict is recorded)
    Fail(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts allowed after the first timeout
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide the follow-up for an attempt.
    ///
    /// # Parameters
    /// - `attempt`: 1-based number of the attempt that produced `result`
    pub fn decide(&self, attempt: u32, result: &ExecutionResult) -> AttemptDecision {
        if result.is_timeout() {
            if attempt <= self.max_retries {
                AttemptDecision::Retry
            } else {
                AttemptDecision::Fail(FailureReason::Timeout)
            }
        } else if let Some(error) = &result.error {
            AttemptDecision::Fail(FailureReason::WorkerError {
                message: error.clone(),
            })
        } else {
            AttemptDecision::Complete
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::TIMEOUT_ERROR;
    use crate::task::TaskId;

    fn result(error: Option<&str>) -> ExecutionResult {
        ExecutionResult {
            task_id: TaskId::derive("retry", 0),
            worker_id: "w".to_string(),
            attempt: 1,
            output: String::new(),
            learning: None,
            error: error.map(str::to_string),
            duration_ms: 10,
        }
    }

    #[test]
    fn test_timeout_retried_once_by_default() {
        let policy = RetryPolicy::default();
        let timed_out = result(Some(TIMEOUT_ERROR));
        assert_eq!(policy.decide(1, &timed_out), AttemptDecision::Retry);
        assert_eq!(
            policy.decide(2, &timed_out),
            AttemptDecision::Fail(FailureReason::Timeout)
        );
    }

    #[test]
    fn test_worker_error_not_retried() {
        let policy = RetryPolicy::new(3);
        assert_eq!(
            policy.decide(1, &result(Some("exit 1"))),
            AttemptDecision::Fail(FailureReason::WorkerError {
                message: "exit 1".to_string()
            })
        );
    }

    #[test]
    fn test_zero_retries() {
        let policy = RetryPolicy::new(0);
        assert_eq!(
            policy.decide(1, &result(Some(TIMEOUT_ERROR))),
            AttemptDecision::Fail(FailureReason::Timeout)
        );
        assert_eq!(policy.decide(1, &result(None)), AttemptDecision::Complete);
    }
}
