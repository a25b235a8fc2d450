//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /api/requests`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitRequest {
    /// Free-text request to decompose
    pub request: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitResponse {
    pub id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CancelResponse {
    /// Whether the cancellation was accepted
    pub cancelled: bool,
}

/// Query string of `GET /api/feedback`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FeedbackParams {
    pub worker_id: Option<String>,
    pub request_id: Option<Uuid>,
    /// Inclusive lower bound (RFC3339)
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound (RFC3339)
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Registered workers
    pub workers: usize,

    /// Tasks currently holding a dispatch slot
    pub in_flight: usize,

    pub max_concurrent_agents: usize,

    /// Whether feedback survives a restart
    pub feedback_persistent: bool,
}
