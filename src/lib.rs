//! # taskmesh
//!
//! Multi-agent task orchestrator. A free-text request is split into
//! capability-tagged tasks, each task runs on a registered worker, and every
//! worker output is checked before it is accepted.
//!
//! This library provides:
//! - A request decomposer and a static worker registry
//! - A concurrency-capped dispatcher with timeouts, retries and cancellation
//! - An output validator that treats worker claims as untrusted
//! - An append-only feedback log with memory, file and SQLite backends
//! - An HTTP API to submit, poll and cancel requests
//!
//! ## Architecture
//!
//! ```text
//!   request ──► Decomposer ──► Dispatcher ──► ExecutionRunner ──► Validator
//!                                  ▲               (worker)           │
//!                                  │                                  ▼
//!                            WorkerRegistry                    FeedbackStore
//!                                                                     │
//!                                                                     ▼
//!                                                               Synthesizer
//! ```
//!
//! ## Request Flow
//! 1. `Orchestrator::submit` decomposes the request and returns its id
//! 2. Pending tasks are assigned, highest priority first, while the global
//!    ceiling allows
//! 3. Each attempt runs under a timeout; timeouts are retried
//! 4. Every finished attempt is validated and recorded
//! 5. The synthesized report is published on the request status
//!
//! ## Modules
//! - `task`: Task model and request decomposition
//! - `workers`: Worker registry and executors
//! - `dispatch`: Capability matching and the concurrency ceiling
//! - `runner`: Timed execution and retry policy
//! - `validation`: Output verdicts
//! - `feedback`: Feedback records and stores
//! - `synthesis`: Final per-request report
//! - `orchestrator`: Submit / status / cancel
//! - `api`: HTTP surface

pub mod api;
pub mod config;
pub mod dispatch;
pub mod feedback;
pub mod orchestrator;
pub mod runner;
pub mod synthesis;
pub mod task;
pub mod util;
pub mod validation;
pub mod workers;

pub use config::Config;
pub use feedback::{FeedbackRecord, FeedbackStore};
pub use orchestrator::{Orchestrator, OrchestratorContext, RequestStatus};
pub use task::{Task, TaskId, TaskStatus};
pub use workers::WorkerRegistry;
