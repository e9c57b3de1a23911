//! Remote authority client

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::tracker::OutboundChange;
use super::types::RemoteDelta;
use crate::error::{Result, SyncError};

/// The server side of sync
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Push one table's compressed changes
    async fn push_batch(&self, table: &str, changes: &[OutboundChange]) -> Result<()>;

    /// Changes recorded by the authority after `since` (everything when `None`)
    async fn fetch_changes_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteDelta>>;
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    tenant_id: &'a str,
    device_id: &'a str,
    changes: &'a [OutboundChange],
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    changes: Vec<RemoteDelta>,
}

/// JSON-over-HTTP remote
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
    tenant_id: String,
    device_id: String,
    timeout_secs: u64,
}

impl HttpRemoteApi {
    pub fn new(base_url: &str, tenant_id: &str, device_id: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| SyncError::Validation(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tenant_id: tenant_id.to_string(),
            device_id: device_id.to_string(),
            timeout_secs,
        })
    }

    fn map_error(&self, e: reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout(self.timeout_secs)
        } else if let Some(status) = e.status() {
            SyncError::Remote {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            SyncError::Transient(format!("Remote unreachable: {}", e))
        }
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::Remote {
            status: status.as_u16(),
            message: body,
        })
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn push_batch(&self, table: &str, changes: &[OutboundChange]) -> Result<()> {
        let url = format!("{}/sync/{}/push", self.base_url, table);
        let request = PushRequest {
            tenant_id: &self.tenant_id,
            device_id: &self.device_id,
            changes,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.check_status(response).await?;

        tracing::debug!(table = %table, changes = changes.len(), "Pushed batch");
        Ok(())
    }

    async fn fetch_changes_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteDelta>> {
        let url = format!("{}/sync/changes", self.base_url);
        let mut query = vec![("tenant_id", self.tenant_id.clone())];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let response = self.check_status(response).await?;

        let body: ChangesResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                SyncError::Validation(format!("Malformed changes response: {}", e))
            } else {
                self.map_error(e)
            }
        })?;
        Ok(body.changes)
    }
}
