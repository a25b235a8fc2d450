//! HTTP API for taskmesh.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/requests` - Submit a request, returns its id
//! - `GET /api/requests` - List requests, newest first
//! - `GET /api/requests/{id}` - Request status and per-task report
//! - `POST /api/requests/{id}/cancel` - Cancel a running request
//! - `GET /api/workers` - List registered workers
//! - `GET /api/feedback` - Query feedback (`worker_id`, `request_id`, `since`, `until`)
//! - `GET /api/feedback/stats/{worker_id}` - Aggregated verdicts for a worker

mod routes;
pub mod types;

pub use routes::{build_state, router, serve, AppState};
pub use types::*;
