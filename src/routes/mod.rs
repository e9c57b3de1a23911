//! Admin HTTP surface

pub mod audit;
pub mod health;
pub mod integrity;
pub mod sync;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest("/api/v1/sync", sync::router())
        .nest("/api/v1/queue", sync::queue_router())
        .nest("/api/v1/audit", audit::router())
        .nest("/api/v1/integrity", integrity::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::audit::AuditLog;
    use crate::config::Config;
    use crate::context::{Clock, SessionContext, SystemClock};
    use crate::hashing::Sha256Hasher;
    use crate::integrity::ChecksumService;
    use crate::payload::from_json;
    use crate::store::{KeyValueStore, MemoryStore};
    use crate::sync::remote::mock::MockRemote;
    use crate::sync::{
        ConflictResolver, Operation, OrchestratorConfig, QueueConfig, SyncOrchestrator, SyncQueue, SyncServices,
    };

    fn test_state() -> AppState {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let context = SessionContext::new("t1", "device-a", "admin");
        let services = SyncServices {
            store: store.clone(),
            queue: SyncQueue::new(store.clone(), clock.clone(), QueueConfig::default()),
            audit: AuditLog::new(store.clone(), Arc::new(Sha256Hasher), clock.clone(), context.clone()),
            checksums: ChecksumService::new(store, Arc::new(Sha256Hasher), clock.clone()),
            remote: Arc::new(MockRemote::new()),
            clock,
        };
        let orchestrator = SyncOrchestrator::new(services, ConflictResolver::new(), context, OrchestratorConfig::default());
        AppState::new(Config::default(), Arc::new(orchestrator))
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state();
        let (status, body) = call(&state, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["tenant_id"], "t1");
    }

    #[tokio::test]
    async fn test_sync_and_status() {
        let state = test_state();
        state
            .orchestrator()
            .record_local_change("clients", "c-1", Operation::Insert, from_json(json!({"name": "Ana"})).unwrap())
            .await
            .unwrap();

        let (status, body) = call(&state, "GET", "/api/v1/sync/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue"]["pending"], 1);

        let (status, body) = call(&state, "POST", "/api/v1/sync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["uploaded"], 1);

        let (_, body) = call(&state, "POST", "/api/v1/sync/online", Some(json!({"online": false}))).await;
        assert_eq!(body["online"], false);
        let (_, body) = call(&state, "POST", "/api/v1/sync", None).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_audit_endpoints() {
        let state = test_state();
        let o = state.orchestrator();
        o.record_local_change("clients", "c-1", Operation::Insert, from_json(json!({"name": "A"})).unwrap())
            .await
            .unwrap();
        o.record_local_change("clients", "c-1", Operation::Update, from_json(json!({"name": "B"})).unwrap())
            .await
            .unwrap();

        let (status, body) = call(&state, "GET", "/api/v1/audit/verify", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], true);
        assert_eq!(body["entries_checked"], 2);

        let (status, body) = call(&state, "GET", "/api/v1/audit/state/clients/c-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["name"], "B");

        let (_, body) = call(&state, "GET", "/api/v1/audit/events?event_type=UPDATE", None).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_integrity_endpoints() {
        let state = test_state();
        state
            .orchestrator()
            .record_local_change("payments", "p-1", Operation::Insert, from_json(json!({"amount": 10})).unwrap())
            .await
            .unwrap();

        let (status, body) = call(&state, "POST", "/api/v1/integrity/check", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["valid"], 1);

        let (_, body) = call(&state, "GET", "/api/v1/integrity/payments/p-1", None).await;
        assert_eq!(body["valid"], true);

        let (status, body) = call(&state, "GET", "/api/v1/integrity/payments/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_queue_endpoints() {
        let state = test_state();
        let (status, body) = call(&state, "GET", "/api/v1/queue/failed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, _) = call(&state, "POST", "/api/v1/queue/nope/retry", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&state, "POST", "/api/v1/queue/failed/retry", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retried"], 0);
    }
}
