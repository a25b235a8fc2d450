//! Execution runner - invokes a worker on a task under a timeout.
//!
//! The worker future runs on its own tokio task so a panic or a hang inside
//! the worker never reaches the caller:
//! - timeout: the attempt is aborted and reported with `error = "TimeoutError"`
//! - worker `Err` or panic: wrapped into `error`
//! - request cancellation: the attempt is aborted and no result is produced

mod retry;

pub use retry::{AttemptDecision, RetryPolicy};

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::task::TaskId;
use crate::workers::{TaskInput, Worker, WorkerContext};

/// Error string recorded for an attempt that exceeded the timeout.
pub const TIMEOUT_ERROR: &str = "TimeoutError";

/// Result of one execution attempt. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub worker_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub output: String,
    /// Worker self-report, if any
    pub learning: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(TIMEOUT_ERROR)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of `ExecutionRunner::run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Finished(ExecutionResult),
    /// The request was cancelled; the attempt left no result
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecutionRunner {
    timeout: Duration,
    working_dir: PathBuf,
}

impl ExecutionRunner {
    pub fn new(timeout: Duration, working_dir: PathBuf) -> Self {
        Self {
            timeout,
            working_dir,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one attempt of `input` on `worker`.
    ///
    /// # Postconditions
    /// - Returns within roughly `timeout` even if the worker never yields
    /// - Never panics because the worker panicked
    pub async fn run(
        &self,
        input: TaskInput,
        worker: &Worker,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let task_id = input.task_id;
        let worker_id = worker.id().to_string();
        let attempt_token = cancel.child_token();
        let ctx = WorkerContext {
            working_dir: self.working_dir.clone(),
            attempt,
            cancel: attempt_token.clone(),
        };

        let executor = worker.executor();
        let started = Instant::now();
        let mut handle = tokio::spawn(async move { executor.execute(input, ctx).await });

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                attempt_token.cancel();
                handle.abort();
                tracing::info!(task_id = %task_id, worker_id = %worker_id, attempt, "Attempt cancelled");
                return RunOutcome::Cancelled;
            }
            joined = tokio::time::timeout(self.timeout, &mut handle) => joined,
        };

        let (output, learning, error) = match joined {
            Err(_) => {
                attempt_token.cancel();
                handle.abort();
                tracing::warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    attempt,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Attempt timed out"
                );
                (String::new(), None, Some(TIMEOUT_ERROR.to_string()))
            }
            Ok(Ok(Ok(out))) => (out.output, out.learning, None),
            Ok(Ok(Err(message))) => {
                tracing::warn!(task_id = %task_id, worker_id = %worker_id, attempt, "Worker error: {}", message);
                (String::new(), None, Some(message))
            }
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    format!("worker panicked: {}", panic_message(join_err.into_panic()))
                } else {
                    "worker task aborted".to_string()
                };
                tracing::error!(task_id = %task_id, worker_id = %worker_id, attempt, "{}", message);
                (String::new(), None, Some(message))
            }
        };

        RunOutcome::Finished(ExecutionResult {
            task_id,
            worker_id,
            attempt,
            output,
            learning,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
