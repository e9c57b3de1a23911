use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    tenant_id: String,
    device_id: String,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let context = state.orchestrator().context();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        tenant_id: context.tenant_id.clone(),
        device_id: context.device_id.clone(),
    })
}
