//! Per-request pipeline: dispatch, execute, validate, record, synthesize.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{OrchestratorContext, RequestEntry, RequestPhase};
use crate::dispatch::DispatchPermit;
use crate::feedback::FeedbackRecord;
use crate::runner::{AttemptDecision, RunOutcome};
use crate::synthesis::Attempt;
use crate::task::{FailureReason, Task};
use crate::workers::TaskInput;

type FinishedAttempt = (usize, RunOutcome, DispatchPermit);

pub(super) struct RequestRun {
    id: Uuid,
    ctx: Arc<OrchestratorContext>,
    entry: Arc<RequestEntry>,
    tasks: Vec<Task>,
    attempts: Vec<Attempt>,
    store_errors: Vec<String>,
}

impl RequestRun {
    pub(super) fn new(
        id: Uuid,
        ctx: Arc<OrchestratorContext>,
        entry: Arc<RequestEntry>,
        tasks: Vec<Task>,
    ) -> Self {
        Self {
            id,
            ctx,
            entry,
            tasks,
            attempts: Vec::new(),
            store_errors: Vec::new(),
        }
    }

    pub(super) async fn run(mut self) {
        let cancel = self.entry.cancel.clone();
        let dispatcher = Arc::clone(&self.ctx.dispatcher);
        let mut in_flight: JoinSet<FinishedAttempt> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            // Register for wakeups before looking at capacity.
            let capacity = dispatcher.capacity_freed();
            tokio::pin!(capacity);
            capacity.as_mut().enable();

            let round = dispatcher.dispatch_pending(&mut self.tasks);
            let waiting = !round.queued.is_empty();
            for (index, permit) in round.assigned {
                self.launch(&mut in_flight, index, permit, &cancel);
            }
            self.publish(RequestPhase::Running);

            if !waiting && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(joined) = in_flight.join_next() => match joined {
                    Ok((index, outcome, permit)) => {
                        drop(permit);
                        self.finish_attempt(index, outcome, &cancel).await;
                    }
                    Err(e) => {
                        tracing::error!(request_id = %self.id, "Attempt task failed: {}", e);
                    }
                },
                _ = capacity.as_mut(), if waiting => {}
            }
        }

        if cancelled {
            let stopping = self
                .tasks
                .iter()
                .filter(|t| t.status().is_in_flight())
                .count();
            self.fail_remaining(FailureReason::Cancelled);
            self.publish(RequestPhase::Cancelled);
            tracing::info!(request_id = %self.id, stopping, "Request cancelled");
            self.drain(&mut in_flight).await;
        } else {
            // Anything still open lost its attempt task.
            self.fail_remaining(FailureReason::WorkerError {
                message: "execution task aborted".to_string(),
            });
            self.publish(RequestPhase::Completed);
        }

        self.entry.done.send_replace(true);
    }

    fn launch(
        &mut self,
        in_flight: &mut JoinSet<FinishedAttempt>,
        index: usize,
        permit: DispatchPermit,
        cancel: &CancellationToken,
    ) {
        let task = &mut self.tasks[index];
        if let Err(e) = task.start() {
            tracing::error!(request_id = %self.id, task_id = %task.id(), "Cannot start task: {}", e);
            return;
        }
        let attempt = task.attempts();
        let input = TaskInput::from(&*task);
        tracing::info!(
            request_id = %self.id,
            task_id = %task.id(),
            worker_id = permit.worker().id(),
            attempt,
            "Attempt started"
        );

        let ctx = Arc::clone(&self.ctx);
        let cancel = cancel.clone();
        in_flight.spawn(async move {
            let outcome = ctx.runner.run(input, permit.worker(), attempt, &cancel).await;
            (index, outcome, permit)
        });
    }

    /// Validate, record and apply one finished attempt.
    ///
    /// Cancellation is checked last before the feedback write. Once the write
    /// has started the attempt counts as finished, even if a cancel lands
    /// while it is in progress.
    async fn finish_attempt(
        &mut self,
        index: usize,
        outcome: RunOutcome,
        cancel: &CancellationToken,
    ) {
        let RunOutcome::Finished(result) = outcome else {
            let _ = self.tasks[index].fail(FailureReason::Cancelled);
            return;
        };

        let verdict = self.ctx.validator.validate(&result);
        let decision = self.ctx.retry.decide(result.attempt, &result);

        if cancel.is_cancelled() {
            let _ = self.tasks[index].fail(FailureReason::Cancelled);
            return;
        }
        let record = FeedbackRecord::new(self.id, &verdict, &result);
        if let Err(e) = self.ctx.store.append(record).await {
            tracing::error!(
                request_id = %self.id,
                task_id = %result.task_id,
                "Feedback write failed, request degraded: {}",
                e
            );
            self.store_errors.push(e.to_string());
        }

        let task = &mut self.tasks[index];
        let transition = match &decision {
            AttemptDecision::Complete => task.complete(),
            AttemptDecision::Retry => task.retry(),
            AttemptDecision::Fail(reason) => task.fail(reason.clone()),
        };
        if let Err(e) = transition {
            tracing::error!(request_id = %self.id, task_id = %task.id(), "Task transition failed: {}", e);
        }
        tracing::info!(
            request_id = %self.id,
            task_id = %result.task_id,
            worker_id = %result.worker_id,
            attempt = result.attempt,
            verdict = %verdict.verdict,
            status = %task.status(),
            "Attempt finished"
        );

        self.attempts.push(Attempt { result, verdict });
    }

    fn fail_remaining(&mut self, reason: FailureReason) {
        for task in self.tasks.iter_mut().filter(|t| !t.status().is_terminal()) {
            let _ = task.fail(reason.clone());
        }
    }

    /// Give cancelled attempts the grace period to stop, then abort them.
    async fn drain(&self, in_flight: &mut JoinSet<FinishedAttempt>) {
        let grace = self.ctx.cancel_grace;
        let stopped = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if stopped.is_err() {
            tracing::warn!(
                request_id = %self.id,
                remaining = in_flight.len(),
                "Attempts ignored cancellation, aborting"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
    }

    /// Write the current view into the shared status. Terminal status is frozen.
    ///
    /// A cancel accepted before the final publish turns `Completed` into
    /// `Cancelled`; `Orchestrator::cancel` decides under the same lock.
    fn publish(&self, phase: RequestPhase) {
        let report = self.ctx.synthesizer.synthesize(&self.tasks, &self.attempts);
        let mut status = self.entry.status.lock().unwrap_or_else(|e| e.into_inner());
        if status.phase.is_terminal() {
            return;
        }
        let phase = if phase == RequestPhase::Completed && self.entry.cancel.is_cancelled() {
            RequestPhase::Cancelled
        } else {
            phase
        };
        status.tasks = report.tasks;
        status.degraded = !self.store_errors.is_empty();
        status.store_errors = self.store_errors.clone();
        if phase.is_terminal() {
            status.phase = phase;
            status.outcome = Some(report.outcome);
            status.finished_at = Some(Utc::now());
            tracing::info!(
                request_id = %self.id,
                phase = ?phase,
                outcome = %report.outcome,
                accepted = report.accepted,
                total = report.total,
                degraded = status.degraded,
                "Request finished"
            );
        }
    }
}
