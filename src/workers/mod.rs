//! Workers - execution units that carry out tasks.
//!
//! # Pieces
//! - `WorkerExecutor`: the async seam a worker implements
//! - `WorkerRegistry`: static table of workers and their capabilities
//! - `CommandExecutor`: runs a configured shell command per task
//! - `FnExecutor`: wraps an async closure (tests and embedders)
//!
//! # Sandbox
//! A worker only ever sees a `TaskInput` and a `WorkerContext`. Neither exposes
//! a way to submit new requests, so workers cannot spawn further work.

mod command;
mod registry;

pub use command::CommandExecutor;
pub use registry::{RegistryError, Worker, WorkerInfo, WorkerRegistry, WorkerSpec, WorkersFile};

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::task::{CapabilitySet, Task, TaskId};

/// Prefix of an output line carrying the worker's self-reported learning.
pub const LEARNING_PREFIX: &str = "LEARNING:";

/// What a worker is told about the task it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub task_id: TaskId,
    pub description: String,
    pub capabilities: CapabilitySet,
}

impl From<&Task> for TaskInput {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id(),
            description: task.description().to_string(),
            capabilities: task.required_capabilities().clone(),
        }
    }
}

/// Execution context handed to a worker for one attempt.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Directory commands run in and relative paths resolve against
    pub working_dir: PathBuf,

    /// 1-based attempt number
    pub attempt: u32,

    /// Cancelled when the request is cancelled or the attempt times out
    pub cancel: CancellationToken,
}

/// Successful worker output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub output: String,
    pub learning: Option<String>,
}

impl WorkerOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            learning: None,
        }
    }

    pub fn with_learning(mut self, learning: impl Into<String>) -> Self {
        self.learning = Some(learning.into());
        self
    }

    /// Split raw worker text into output and `LEARNING:` self-report lines.
    ///
    /// Multiple learning lines are joined with a newline.
    pub fn from_raw(raw: &str) -> Self {
        let mut output_lines = Vec::new();
        let mut learnings = Vec::new();
        for line in raw.lines() {
            match line.trim_start().strip_prefix(LEARNING_PREFIX) {
                Some(rest) => {
                    let rest = rest.trim();
                    if !rest.is_empty() {
                        learnings.push(rest.to_string());
                    }
                }
                None => output_lines.push(line),
            }
        }
        Self {
            output: output_lines.join("\n").trim_end().to_string(),
            learning: if learnings.is_empty() {
                None
            } else {
                Some(learnings.join("\n"))
            },
        }
    }
}

/// The execution function of a worker.
///
/// # Contract
/// - Returns `Err(message)` for failures; never relies on panics for control flow
/// - Should observe `ctx.cancel` and stop promptly when it fires
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, input: TaskInput, ctx: WorkerContext) -> Result<WorkerOutput, String>;

    /// Short description for listings.
    fn describe(&self) -> String {
        "worker".to_string()
    }
}

/// Executor backed by an async closure.
pub struct FnExecutor<F> {
    func: F,
}

impl<F> FnExecutor<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> WorkerExecutor for FnExecutor<F>
where
    F: Fn(TaskInput, WorkerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkerOutput, String>> + Send + 'static,
{
    async fn execute(&self, input: TaskInput, ctx: WorkerContext) -> Result<WorkerOutput, String> {
        (self.func)(input, ctx).await
    }

    fn describe(&self) -> String {
        "in-process function".to_string()
    }
}
