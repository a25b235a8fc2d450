//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::feedback::{create_feedback_store, FeedbackQuery, FeedbackRecord, WorkerStats};
use crate::orchestrator::{
    Orchestrator, OrchestratorContext, OrchestratorError, RequestStatus, RequestSummary,
};
use crate::validation::WorkspaceFs;
use crate::workers::{WorkerInfo, WorkerRegistry};

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the application state: worker registry, feedback store, orchestrator.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let registry = if config.workers_file.exists() {
        WorkerRegistry::load_file(&config.workers_file, &config.workspace_path).await?
    } else {
        tracing::warn!(
            "Worker registry {} not found, starting with no workers",
            config.workers_file.display()
        );
        WorkerRegistry::new()
    };

    let store =
        create_feedback_store(config.store.kind, config.store.dir.clone(), config.store.fsync)
            .await?;

    let ctx = OrchestratorContext::new(
        Arc::new(registry),
        store,
        Arc::new(WorkspaceFs::new(config.workspace_path.clone())),
        config.workspace_path.clone(),
        &config.pipeline,
    );

    Ok(Arc::new(AppState {
        config,
        orchestrator: Arc::new(Orchestrator::new(ctx)),
    }))
}

/// Routes with state attached.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/requests", post(submit_request).get(list_requests))
        .route("/api/requests/:id", get(get_request))
        .route("/api/requests/:id/cancel", post(cancel_request))
        .route("/api/workers", get(list_workers))
        .route("/api/feedback", get(list_feedback))
        .route("/api/feedback/stats/:worker_id", get(worker_stats))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = build_state(config).await?;
    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

/// Wait for Ctrl-C / SIGTERM, then cancel every running request.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, cancelling running requests...");
    state.orchestrator.shutdown().await;
}

fn error_response(err: OrchestratorError) -> (StatusCode, String) {
    match err {
        OrchestratorError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        OrchestratorError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        OrchestratorError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let ctx = state.orchestrator.context();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        workers: ctx.registry().len(),
        in_flight: ctx.dispatcher.in_flight(),
        max_concurrent_agents: ctx.dispatcher.max_concurrent_agents(),
        feedback_persistent: ctx.store.is_persistent(),
    })
}

/// Submit a request for decomposition and dispatch.
async fn submit_request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, String)> {
    let id = state
        .orchestrator
        .submit(&req.request)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { id })))
}

async fn list_requests(State(state): State<Arc<AppState>>) -> Json<Vec<RequestSummary>> {
    Json(state.orchestrator.list())
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RequestStatus>, (StatusCode, String)> {
    state
        .orchestrator
        .status(id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Request {} not found", id)))
}

async fn cancel_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    if state.orchestrator.status(id).is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Request {} not found", id)));
    }
    Ok(Json(CancelResponse {
        cancelled: state.orchestrator.cancel(id),
    }))
}

async fn list_workers(State(state): State<Arc<AppState>>) -> Json<Vec<WorkerInfo>> {
    Json(state.orchestrator.context().registry().infos())
}

async fn list_feedback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FeedbackParams>,
) -> Result<Json<Vec<FeedbackRecord>>, (StatusCode, String)> {
    let query = FeedbackQuery {
        worker_id: params.worker_id,
        request_id: params.request_id,
        since: params.since,
        until: params.until,
    };
    state
        .orchestrator
        .context()
        .store
        .query(&query)
        .await
        .map(Json)
        .map_err(|e| error_response(e.into()))
}

async fn worker_stats(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Result<Json<WorkerStats>, (StatusCode, String)> {
    let ctx = state.orchestrator.context();
    if ctx.registry().get(&worker_id).is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Worker {} not found", worker_id)));
    }
    ctx.store
        .worker_stats(&worker_id)
        .await
        .map(Json)
        .map_err(|e| error_response(e.into()))
}
