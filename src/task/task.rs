//! Core Task type with capability requirements and lifecycle transitions.
//!
//! # Invariants
//! - `description` is non-empty
//! - `id` is unique within a request (derived from request text and position)
//! - Terminal states (`Completed`, `Failed`) never transition again

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::capability::{format_capabilities, CapabilitySet};

/// Unique identifier for a task.
///
/// # Properties
/// - Deterministic: the same request text and position always yield the same id
/// - Immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Derive the id of the task at `position` within `request`.
    pub fn derive(request: &str, position: usize) -> Self {
        let name = format!("{}:{}", position, request);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// No registered worker declares the required capabilities
    NoCapableWorker,
    /// Every attempt exceeded the execution timeout
    Timeout,
    /// The worker returned an error or panicked
    WorkerError { message: String },
    /// The enclosing request was cancelled
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCapableWorker => write!(f, "NoCapableWorkerError"),
            Self::Timeout => write!(f, "TimeoutError"),
            Self::WorkerError { message } => write!(f, "WorkerError: {}", message),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Dispatched -> Running -> Completed
///    |           ^            |  \-> Failed
///    |           |            v
///    |           +------- Retrying
///    \-> Failed (no capable worker, cancelled)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the dispatch queue
    Pending,
    /// Assigned to a worker, execution not started yet
    Dispatched,
    /// The worker is executing the task
    Running,
    /// An attempt timed out and the task is queued again
    Retrying,
    /// Execution finished and the output was validated
    Completed,
    /// Terminal failure
    Failed { reason: FailureReason },
}

impl TaskStatus {
    /// `true` if the task is Completed or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }

    /// `true` while the task waits for a dispatch slot.
    pub fn is_queued(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }

    /// `true` while the task holds a worker slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Dispatched => write!(f, "Dispatched"),
            Self::Running => write!(f, "Running"),
            Self::Retrying => write!(f, "Retrying"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed { reason } => write!(f, "Failed:{}", reason),
        }
    }
}

/// A unit of decomposed work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,

    /// Position in the decomposer output (used to reassemble reports)
    position: usize,

    description: String,

    required_capabilities: CapabilitySet,

    /// Higher values are dispatched first; ties keep decomposer order
    priority: i32,

    status: TaskStatus,

    /// Worker the task is (or was last) assigned to
    assigned_worker: Option<String>,

    /// Number of execution attempts started
    attempts: u32,

    created_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task in `Pending`.
    ///
    /// # Errors
    /// Returns `Err` if `description` is blank.
    pub fn new(
        id: TaskId,
        position: usize,
        description: impl Into<String>,
        required_capabilities: CapabilitySet,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Result<Self, TaskError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(TaskError::EmptyDescription);
        }

        Ok(Self {
            id,
            position,
            description,
            required_capabilities,
            priority,
            status: TaskStatus::Pending,
            assigned_worker: None,
            attempts: 0,
            created_at,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn required_capabilities(&self) -> &CapabilitySet {
        &self.required_capabilities
    }

    pub fn capabilities_label(&self) -> String {
        format_capabilities(&self.required_capabilities)
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn assigned_worker(&self) -> Option<&str> {
        self.assigned_worker.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // State transitions - explicit and validated

    /// Pending/Retrying -> Dispatched.
    pub fn dispatch(&mut self, worker_id: &str) -> Result<(), TaskError> {
        if !self.status.is_queued() {
            return Err(self.invalid("Dispatched"));
        }
        self.status = TaskStatus::Dispatched;
        self.assigned_worker = Some(worker_id.to_string());
        Ok(())
    }

    /// Dispatched -> Running. Counts one attempt.
    pub fn start(&mut self) -> Result<(), TaskError> {
        match self.status {
            TaskStatus::Dispatched => {
                self.status = TaskStatus::Running;
                self.attempts += 1;
                Ok(())
            }
            _ => Err(self.invalid("Running")),
        }
    }

    /// Running -> Completed.
    pub fn complete(&mut self) -> Result<(), TaskError> {
        match self.status {
            TaskStatus::Running => {
                self.status = TaskStatus::Completed;
                Ok(())
            }
            _ => Err(self.invalid("Completed")),
        }
    }

    /// Running -> Retrying.
    pub fn retry(&mut self) -> Result<(), TaskError> {
        match self.status {
            TaskStatus::Running => {
                self.status = TaskStatus::Retrying;
                Ok(())
            }
            _ => Err(self.invalid("Retrying")),
        }
    }

    /// Any non-terminal state -> Failed.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TaskError> {
        if self.status.is_terminal() {
            return Err(self.invalid("Failed"));
        }
        self.status = TaskStatus::Failed { reason };
        Ok(())
    }

    fn invalid(&self, to: &str) -> TaskError {
        TaskError::InvalidTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task description cannot be empty")]
    EmptyDescription,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Capability;

    fn sample_task() -> Task {
        let caps = [Capability::Implement].into_iter().collect();
        Task::new(TaskId::derive("implement x", 0), 0, "implement x", caps, 0, Utc::now()).unwrap()
    }

    #[test]
    fn test_empty_description_rejected() {
        let result = Task::new(
            TaskId::derive("", 0),
            0,
            "   ",
            CapabilitySet::new(),
            0,
            Utc::now(),
        );
        assert_eq!(result.unwrap_err(), TaskError::EmptyDescription);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = sample_task();
        task.dispatch("coder").unwrap();
        assert_eq!(task.assigned_worker(), Some("coder"));
        assert!(task.status().is_in_flight());
        task.start().unwrap();
        assert_eq!(task.attempts(), 1);
        assert!(task.status().is_in_flight());
        task.complete().unwrap();
        assert!(task.status().is_terminal());
        assert!(!task.status().is_in_flight());
    }

    #[test]
    fn test_retry_then_redispatch() {
        let mut task = sample_task();
        task.dispatch("coder").unwrap();
        task.start().unwrap();
        task.retry().unwrap();
        assert!(task.status().is_queued());
        task.dispatch("coder").unwrap();
        task.start().unwrap();
        assert_eq!(task.attempts(), 2);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = sample_task();
        task.fail(FailureReason::NoCapableWorker).unwrap();
        assert!(task.dispatch("coder").is_err());
        assert!(task.fail(FailureReason::Cancelled).is_err());
        assert_eq!(task.status().to_string(), "Failed:NoCapableWorkerError");
    }

    #[test]
    fn test_cannot_start_undispatched_task() {
        let mut task = sample_task();
        assert!(matches!(
            task.start(),
            Err(TaskError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_task_id_is_deterministic() {
        assert_eq!(TaskId::derive("a and b", 1), TaskId::derive("a and b", 1));
        assert_ne!(TaskId::derive("a and b", 0), TaskId::derive("a and b", 1));
    }
}
