//! Integrity API endpoints

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use crate::error::{Result, SyncError};
use crate::integrity::{ChecksumVerification, IntegrityReport};
use crate::state::AppState;

/// Create the integrity router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/check", post(run_check))
        .route("/:record_type/:record_id", get(verify_record))
}

async fn run_check(State(state): State<AppState>) -> Result<Json<IntegrityReport>> {
    Ok(Json(state.orchestrator().checksums().perform_integrity_check().await?))
}

async fn verify_record(
    State(state): State<AppState>,
    Path((record_type, record_id)): Path<(String, String)>,
) -> Result<Json<ChecksumVerification>> {
    let checksums = state.orchestrator().checksums();
    let doc = checksums
        .load_document(&record_type, &record_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("{}/{}", record_type, record_id)))?;
    Ok(Json(checksums.verify_checksum(&record_type, &doc)?))
}
