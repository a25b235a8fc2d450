//! Dispatcher - matches queued tasks to workers.
//!
//! # Rules
//! - A task goes to exactly one worker whose capabilities cover its requirements
//!   and whose `current_load < max_concurrency`
//! - Ties: lowest `current_load`, then registry insertion order
//! - No capable worker in the registry at all: the task fails with
//!   `NoCapableWorker` (never silently dropped)
//! - Total in-flight tasks across all workers and requests never exceed
//!   `max_concurrent_agents`; once reached, remaining tasks stay queued
//! - The same task is never in flight twice on the same worker
//!
//! # Resource Accounting
//! An assignment returns a `DispatchPermit`. Dropping the permit releases the
//! worker slot and the global slot, then wakes anyone waiting for capacity.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::task::{FailureReason, Task, TaskId};
use crate::workers::{Worker, WorkerRegistry};

/// Outcome of trying to place one task.
#[derive(Debug)]
pub enum Assignment {
    /// Task placed; the permit holds the slot until dropped
    Assigned(DispatchPermit),
    /// No registered worker covers the required capabilities
    NoCapableWorker,
    /// Capable workers exist but all are at capacity
    WorkersBusy,
    /// The global `max_concurrent_agents` ceiling is reached
    CeilingReached,
    /// Every capable worker with room already runs this task
    AlreadyInFlight,
}

#[derive(Debug, Default)]
struct DispatchState {
    in_flight: usize,
    running: HashSet<(TaskId, String)>,
}

/// Shared dispatcher. One instance serves every request so the global
/// ceiling holds process-wide.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    max_concurrent_agents: usize,
    state: Mutex<DispatchState>,
    capacity_freed: Notify,
}

impl Dispatcher {
    /// Create a dispatcher. A ceiling of zero is raised to one.
    pub fn new(registry: Arc<WorkerRegistry>, max_concurrent_agents: usize) -> Arc<Self> {
        Arc::new(Self {
            registry,
            max_concurrent_agents: max_concurrent_agents.max(1),
            state: Mutex::new(DispatchState::default()),
            capacity_freed: Notify::new(),
        })
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn max_concurrent_agents(&self) -> usize {
        self.max_concurrent_agents
    }

    /// Number of tasks currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).in_flight
    }

    /// Future that resolves the next time a slot is released.
    ///
    /// Create (and `enable`) it before inspecting capacity to avoid missing a wakeup.
    pub fn capacity_freed(&self) -> Notified<'_> {
        self.capacity_freed.notified()
    }

    /// Try to place a single task.
    pub fn assign(self: &Arc<Self>, task: &Task) -> Assignment {
        let required = task.required_capabilities();
        let mut candidates = self.registry.capable_of(required);
        if candidates.is_empty() {
            return Assignment::NoCapableWorker;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.in_flight >= self.max_concurrent_agents {
            return Assignment::CeilingReached;
        }

        candidates.retain(|w| !state.running.contains(&(task.id(), w.id().to_string())));
        if candidates.is_empty() {
            return Assignment::AlreadyInFlight;
        }
        candidates.retain(|w| w.has_capacity());
        if candidates.is_empty() {
            return Assignment::WorkersBusy;
        }

        // Stable sort keeps registry order among equal loads.
        candidates.sort_by_key(|w| w.current_load());

        for worker in candidates {
            if worker.try_acquire() {
                state.in_flight += 1;
                state.running.insert((task.id(), worker.id().to_string()));
                tracing::debug!(
                    task_id = %task.id(),
                    worker_id = worker.id(),
                    load = worker.current_load(),
                    in_flight = state.in_flight,
                    "Task dispatched"
                );
                return Assignment::Assigned(DispatchPermit {
                    dispatcher: Arc::clone(self),
                    worker,
                    task_id: task.id(),
                });
            }
        }

        Assignment::WorkersBusy
    }

    /// Walk queued tasks in dispatch order and place as many as capacity allows.
    ///
    /// Placed tasks transition to `Dispatched`; tasks with no capable worker
    /// transition to `Failed { NoCapableWorker }`. Everything else stays queued.
    pub fn dispatch_pending(self: &Arc<Self>, tasks: &mut [Task]) -> DispatchRound {
        let mut round = DispatchRound::default();

        for index in dispatch_order(tasks) {
            let task = &mut tasks[index];
            match self.assign(task) {
                Assignment::Assigned(permit) => {
                    if let Err(e) = task.dispatch(permit.worker().id()) {
                        tracing::error!("Dispatch transition failed for {}: {}", task.id(), e);
                        continue;
                    }
                    round.assigned.push((index, permit));
                }
                Assignment::NoCapableWorker => {
                    tracing::warn!(
                        task_id = %task.id(),
                        capabilities = %task.capabilities_label(),
                        "No capable worker for task"
                    );
                    if task.fail(FailureReason::NoCapableWorker).is_ok() {
                        round.failed.push(index);
                    }
                }
                Assignment::WorkersBusy | Assignment::AlreadyInFlight => {
                    round.queued.push(index);
                }
                Assignment::CeilingReached => {
                    round.queued.push(index);
                    round.ceiling_reached = true;
                }
            }
        }

        round
    }

    fn release(&self, worker: &Worker, task_id: TaskId) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_flight = state.in_flight.saturating_sub(1);
            state.running.remove(&(task_id, worker.id().to_string()));
            worker.release();
        }
        self.capacity_freed.notify_waiters();
    }
}

/// Indices of queued tasks, highest priority first, then decomposer order.
pub fn dispatch_order(tasks: &[Task]) -> Vec<usize> {
    let mut order: Vec<usize> = tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.status().is_queued())
        .map(|(i, _)| i)
        .collect();
    order.sort_by(|&a, &b| {
        tasks[b]
            .priority()
            .cmp(&tasks[a].priority())
            .then(tasks[a].position().cmp(&tasks[b].position()))
    });
    order
}

/// Result of one `dispatch_pending` pass.
#[derive(Debug, Default)]
pub struct DispatchRound {
    /// (task index, permit) for every task placed this round
    pub assigned: Vec<(usize, DispatchPermit)>,
    /// Indices of tasks failed with `NoCapableWorker`
    pub failed: Vec<usize>,
    /// Indices left in the queue
    pub queued: Vec<usize>,
    /// Whether the global ceiling stopped the round
    pub ceiling_reached: bool,
}

/// A held worker slot. Released on drop.
pub struct DispatchPermit {
    dispatcher: Arc<Dispatcher>,
    worker: Arc<Worker>,
    task_id: TaskId,
}

impl DispatchPermit {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl std::fmt::Debug for DispatchPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPermit")
            .field("worker", &self.worker.id())
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        self.dispatcher.release(&self.worker, self.task_id);
    }
}
