//! Sync API endpoints
//!
//! Triggers sync runs and exposes the upload queue.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::AppState;
use crate::sync::{SyncOptions, SyncQueueItem, SyncReport, SyncStatus};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(run_sync))
        .route("/status", get(get_status))
        .route("/online", post(set_online))
}

/// Create the queue router
pub fn queue_router() -> Router<AppState> {
    Router::new()
        .route("/failed", get(get_failed))
        .route("/failed/retry", post(retry_all))
        .route("/:id/retry", post(retry_item))
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncParams {
    #[serde(default)]
    pub force: bool,
}

/// Run one sync cycle and return its report
async fn run_sync(State(state): State<AppState>, Query(params): Query<SyncParams>) -> Json<SyncReport> {
    let report = state
        .orchestrator()
        .sync(SyncOptions {
            force: params.force,
            ..Default::default()
        })
        .await;
    Json(report)
}

async fn get_status(State(state): State<AppState>) -> Result<Json<SyncStatus>> {
    Ok(Json(state.orchestrator().status().await?))
}

#[derive(Debug, Deserialize)]
pub struct OnlineRequest {
    pub online: bool,
}

async fn set_online(State(state): State<AppState>, Json(req): Json<OnlineRequest>) -> Result<Json<SyncStatus>> {
    state.orchestrator().set_online(req.online);
    Ok(Json(state.orchestrator().status().await?))
}

async fn get_failed(State(state): State<AppState>) -> Result<Json<Vec<SyncQueueItem>>> {
    Ok(Json(state.orchestrator().queue().get_failed_operations().await?))
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub retried: usize,
}

async fn retry_item(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<RetryResponse>> {
    state.orchestrator().queue().retry_failed_operation(&id).await?;
    Ok(Json(RetryResponse { retried: 1 }))
}

async fn retry_all(State(state): State<AppState>) -> Result<Json<RetryResponse>> {
    let retried = state.orchestrator().queue().retry_all_failed().await?;
    Ok(Json(RetryResponse { retried }))
}
