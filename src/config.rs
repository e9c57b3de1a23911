//! Configuration management for Fieldsync

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::sync::{OrchestratorConfig, QueueConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub identity: IdentityConfig,
    pub remote: RemoteConfig,
    pub sync: SyncSettings,
    pub queue: QueueSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub tenant_id: String,
    /// Generated and persisted on first start when unset
    pub device_id: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Auto-sync period; 0 disables it
    pub interval_secs: u64,
    pub verify_after_sync: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub retention_hours: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./fieldsync.db".to_string(),
            },
            identity: IdentityConfig {
                tenant_id: "default".to_string(),
                device_id: None,
                user_id: "system".to_string(),
            },
            remote: RemoteConfig {
                url: "http://localhost:8080/api/v1".to_string(),
                timeout_secs: 30,
            },
            sync: SyncSettings {
                interval_secs: 300,
                verify_after_sync: true,
            },
            queue: QueueSettings {
                max_attempts: 10,
                initial_backoff_ms: 1000,
                max_backoff_secs: 300,
                retention_hours: 168,
            },
        }
    }
}

/// Parse `key` if set, else use `default`
fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            identity: IdentityConfig {
                tenant_id: env::var("TENANT_ID").unwrap_or(defaults.identity.tenant_id),
                device_id: env::var("DEVICE_ID").ok().filter(|d| !d.trim().is_empty()),
                user_id: env::var("USER_ID").unwrap_or(defaults.identity.user_id),
            },
            remote: RemoteConfig {
                url: env::var("REMOTE_URL").unwrap_or(defaults.remote.url),
                timeout_secs: parse_var("REMOTE_TIMEOUT_SECS", defaults.remote.timeout_secs)?,
            },
            sync: SyncSettings {
                interval_secs: parse_var("SYNC_INTERVAL_SECS", defaults.sync.interval_secs)?,
                verify_after_sync: parse_var("VERIFY_AFTER_SYNC", defaults.sync.verify_after_sync)?,
            },
            queue: QueueSettings {
                max_attempts: parse_var("QUEUE_MAX_ATTEMPTS", defaults.queue.max_attempts)?,
                initial_backoff_ms: parse_var("QUEUE_INITIAL_BACKOFF_MS", defaults.queue.initial_backoff_ms)?,
                max_backoff_secs: parse_var("QUEUE_MAX_BACKOFF_SECS", defaults.queue.max_backoff_secs)?,
                retention_hours: parse_var("QUEUE_RETENTION_HOURS", defaults.queue.retention_hours)?,
            },
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_attempts: self.queue.max_attempts,
            initial_backoff: chrono::Duration::milliseconds(self.queue.initial_backoff_ms as i64),
            max_backoff: chrono::Duration::seconds(self.queue.max_backoff_secs as i64),
            retention: chrono::Duration::hours(self.queue.retention_hours as i64),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            remote_timeout: Duration::from_secs(self.remote.timeout_secs),
            verify_after_sync: self.sync.verify_after_sync,
        }
    }
}
