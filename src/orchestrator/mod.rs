//! Orchestrator - the Submit / GetStatus / Cancel surface.
//!
//! Every request gets its own pipeline task. All requests share one
//! `OrchestratorContext` (registry, dispatcher, runner, validator, store), so
//! the global concurrency ceiling and the feedback log span requests.
//!
//! # Status
//! - `status()` never fails for a known id; failure is reported as data
//! - Once a request is `Completed` or `Cancelled` its status is frozen
//!
//! # Cancellation
//! `cancel()` fires the request's token. In-flight attempts are told to
//! stop, every open task becomes `Failed:Cancelled`, and nothing further is
//! written to the feedback store for the request.

mod pipeline;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::dispatch::Dispatcher;
use crate::feedback::{FeedbackStore, StoreError};
use crate::runner::{ExecutionRunner, RetryPolicy};
use crate::synthesis::{RequestOutcome, Synthesizer, TaskReport};
use crate::task::{DecomposeError, Decomposer};
use crate::validation::{FsChecker, Validator};
use crate::workers::WorkerRegistry;

use pipeline::RequestRun;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("InvalidRequestError: {0}")]
    InvalidRequest(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DecomposeError> for OrchestratorError {
    fn from(err: DecomposeError) -> Self {
        match err {
            DecomposeError::InvalidRequest(msg) => OrchestratorError::InvalidRequest(msg),
            other => OrchestratorError::InvalidRequest(other.to_string()),
        }
    }
}

/// Everything a request pipeline needs, passed explicitly.
pub struct OrchestratorContext {
    pub decomposer: Decomposer,
    pub dispatcher: Arc<Dispatcher>,
    pub runner: ExecutionRunner,
    pub retry: RetryPolicy,
    pub validator: Validator,
    pub synthesizer: Synthesizer,
    pub store: Arc<dyn FeedbackStore>,
    pub cancel_grace: Duration,
}

impl OrchestratorContext {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn FeedbackStore>,
        fs: Arc<dyn FsChecker>,
        working_dir: PathBuf,
        pipeline: &PipelineConfig,
    ) -> Self {
        Self {
            decomposer: Decomposer::new(),
            dispatcher: Dispatcher::new(registry, pipeline.max_concurrent_agents),
            runner: ExecutionRunner::new(pipeline.task_timeout, working_dir),
            retry: RetryPolicy::new(pipeline.max_retries),
            validator: Validator::new(fs, pipeline.min_evidence),
            synthesizer: Synthesizer::new(),
            store,
            cancel_grace: pipeline.cancel_grace,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        self.dispatcher.registry()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPhase {
    Running,
    Completed,
    Cancelled,
}

impl RequestPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestPhase::Running)
    }
}

/// Poll-able view of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub id: Uuid,
    pub request: String,
    pub phase: RequestPhase,
    /// Set once the request is terminal
    pub outcome: Option<RequestOutcome>,
    /// A feedback write failed; verdicts stand but the audit trail is incomplete
    pub degraded: bool,
    pub store_errors: Vec<String>,
    pub tasks: Vec<TaskReport>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Compact listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub id: Uuid,
    pub request: String,
    pub phase: RequestPhase,
    pub outcome: Option<RequestOutcome>,
    pub degraded: bool,
    pub task_count: usize,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&RequestStatus> for RequestSummary {
    fn from(status: &RequestStatus) -> Self {
        Self {
            id: status.id,
            request: status.request.clone(),
            phase: status.phase,
            outcome: status.outcome,
            degraded: status.degraded,
            task_count: status.tasks.len(),
            submitted_at: status.submitted_at,
            finished_at: status.finished_at,
        }
    }
}

pub(crate) struct RequestEntry {
    status: Mutex<RequestStatus>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RequestEntry {
    fn new(id: Uuid, request: &str, tasks: Vec<TaskReport>, cancel: CancellationToken) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            status: Mutex::new(RequestStatus {
                id,
                request: request.trim().to_string(),
                phase: RequestPhase::Running,
                outcome: None,
                degraded: false,
                store_errors: Vec::new(),
                tasks,
                submitted_at: Utc::now(),
                finished_at: None,
            }),
            cancel,
            done,
            join: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> RequestStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct Orchestrator {
    ctx: Arc<OrchestratorContext>,
    requests: RwLock<HashMap<Uuid, Arc<RequestEntry>>>,
    shutdown: CancellationToken,
    closing: AtomicBool,
}

impl Orchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            requests: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            closing: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    /// Decompose `request` and start its pipeline. Returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// `InvalidRequest` for blank input (no task is created),
    /// `ShuttingDown` once `shutdown` has begun.
    pub async fn submit(&self, request: &str) -> Result<Uuid, OrchestratorError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let tasks = self.ctx.decomposer.decompose(request)?;

        let id = Uuid::new_v4();
        let initial = self.ctx.synthesizer.synthesize(&tasks, &[]);
        let entry = Arc::new(RequestEntry::new(
            id,
            request,
            initial.tasks,
            self.shutdown.child_token(),
        ));

        self.requests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&entry));

        tracing::info!(request_id = %id, tasks = tasks.len(), "Request submitted");
        let run = RequestRun::new(id, Arc::clone(&self.ctx), Arc::clone(&entry), tasks);
        let handle = tokio::spawn(run.run());
        *entry.join.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(id)
    }

    fn entry(&self, id: Uuid) -> Option<Arc<RequestEntry>> {
        self.requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Current status, `None` only for an unknown id.
    pub fn status(&self, id: Uuid) -> Option<RequestStatus> {
        self.entry(id).map(|e| e.snapshot())
    }

    /// Ask a running request to stop.
    ///
    /// Returns `false` for unknown ids and for requests that already finished.
    /// The decision is taken under the status lock, so an accepted cancel
    /// always ends the request `Cancelled`.
    pub fn cancel(&self, id: Uuid) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        {
            let status = entry.status.lock().unwrap_or_else(|e| e.into_inner());
            if status.phase.is_terminal() {
                return false;
            }
            entry.cancel.cancel();
        }
        tracing::info!(request_id = %id, "Cancellation requested");
        true
    }

    /// Wait until the request is terminal and its attempts have stopped.
    pub async fn wait(&self, id: Uuid) -> Option<RequestStatus> {
        let entry = self.entry(id)?;
        let mut done = entry.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
        Some(entry.snapshot())
    }

    /// Summaries of every known request, newest first.
    pub fn list(&self) -> Vec<RequestSummary> {
        let mut summaries: Vec<RequestSummary> = self
            .requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| RequestSummary::from(&e.snapshot()))
            .collect();
        summaries.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Cancel every running request and wait for the pipelines to exit.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(|e| e.join.lock().unwrap_or_else(|e| e.into_inner()).take())
            .collect();
        tracing::info!(pipelines = handles.len(), "Shutting down orchestrator");
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!("Request pipeline ended abnormally: {}", e);
            }
        }
    }
}
