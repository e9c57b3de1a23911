//! Audit API endpoints

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEntry, AuditQuery, ChainVerification};
use crate::error::Result;
use crate::payload::Payload;
use crate::state::AppState;

/// Create the audit router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/verify", get(verify_chain))
        .route("/events", get(list_events))
        .route("/state/:aggregate_type/:aggregate_id", get(reconstruct_state))
}

async fn verify_chain(State(state): State<AppState>) -> Result<Json<ChainVerification>> {
    Ok(Json(state.orchestrator().audit().verify_hash_chain().await?))
}

async fn list_events(State(state): State<AppState>, Query(query): Query<AuditQuery>) -> Result<Json<Vec<AuditEntry>>> {
    Ok(Json(state.orchestrator().audit().query(&query).await?))
}

#[derive(Debug, Deserialize)]
pub struct StateParams {
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub as_of: Option<DateTime<Utc>>,
    /// `None` when the aggregate never existed or was deleted
    pub state: Option<Payload>,
}

async fn reconstruct_state(
    State(state): State<AppState>,
    Path((aggregate_type, aggregate_id)): Path<(String, String)>,
    Query(params): Query<StateParams>,
) -> Result<Json<StateResponse>> {
    let projected = state
        .orchestrator()
        .audit()
        .reconstruct_state(&aggregate_type, &aggregate_id, params.as_of)
        .await?;

    Ok(Json(StateResponse {
        aggregate_type,
        aggregate_id,
        as_of: params.as_of,
        state: projected,
    }))
}
