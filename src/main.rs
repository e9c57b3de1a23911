//! Fieldsync admin server
//!
//! Runs the sync core against a local SQLite store, syncs on an interval,
//! and exposes sync, audit and integrity entry points over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fieldsync::audit::AuditLog;
use fieldsync::config::Config;
use fieldsync::context::{Clock, SessionContext, SystemClock};
use fieldsync::hashing::{Hasher, Sha256Hasher};
use fieldsync::integrity::ChecksumService;
use fieldsync::routes;
use fieldsync::state::AppState;
use fieldsync::store::{self, KeyValueStore, SqliteStore};
use fieldsync::sync::{
    load_or_create_device_id, ConflictResolver, HttpRemoteApi, SyncOptions, SyncOrchestrator, SyncQueue,
    SyncServices,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldsync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Fieldsync v{}", env!("CARGO_PKG_VERSION"));

    // Initialize database
    let pool = store::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);
    let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::new(pool));

    let device_id = match &config.identity.device_id {
        Some(id) => id.clone(),
        None => load_or_create_device_id(kv.as_ref())
            .await
            .context("Failed to load device id")?,
    };
    let context = SessionContext::new(&config.identity.tenant_id, &device_id, &config.identity.user_id);
    tracing::info!(tenant = %context.tenant_id, device = %context.device_id, "Session context ready");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hasher: Arc<dyn Hasher> = Arc::new(Sha256Hasher);
    let remote = HttpRemoteApi::new(
        &config.remote.url,
        &context.tenant_id,
        &context.device_id,
        config.remote.timeout_secs,
    )
    .context("Failed to build remote client")?;

    let services = SyncServices {
        store: kv.clone(),
        queue: SyncQueue::new(kv.clone(), clock.clone(), config.queue_config()),
        audit: AuditLog::new(kv.clone(), hasher.clone(), clock.clone(), context.clone()),
        checksums: ChecksumService::new(kv, hasher, clock.clone()),
        remote: Arc::new(remote),
        clock,
    };
    let orchestrator = Arc::new(SyncOrchestrator::new(
        services,
        ConflictResolver::new(),
        context,
        config.orchestrator_config(),
    ));

    // Report a tampered audit trail at startup; serving continues
    match orchestrator.audit().verify_hash_chain().await.and_then(|v| v.ensure_valid()) {
        Ok(v) => tracing::info!(entries = v.entries_checked, "Audit chain verified"),
        Err(e) => tracing::error!("{}", e),
    }

    let auto_sync = spawn_auto_sync(orchestrator.clone(), config.sync.interval_secs);

    let app = routes::app(AppState::new(config.clone(), orchestrator));

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    tracing::info!("Fieldsync listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(handle) = auto_sync {
        handle.abort();
    }
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Periodic background sync; `None` when disabled
fn spawn_auto_sync(orchestrator: Arc<SyncOrchestrator>, interval_secs: u64) -> Option<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        tracing::info!("Auto-sync disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = orchestrator.sync(SyncOptions::default()).await;
            if !report.success {
                tracing::warn!(
                    errors = report.errors.len(),
                    message = ?report.message,
                    "Auto-sync finished with problems, will retry"
                );
            }
        }
    }))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
