//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::sync::SyncOrchestrator;

/// Shared state for the admin HTTP surface
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(config: Config, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, orchestrator }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the orchestrator (queue, audit log and checksums hang off it)
    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.inner.orchestrator
    }
}
