//! Outbound sync queue
//!
//! Persistent priority queue of local operations waiting for the remote
//! authority. Items move through attempts with exponential backoff; after
//! `max_attempts` failures an item is parked as failed until retried
//! explicitly. Items are never deleted on failure.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::types::{default_priority, Operation};
use crate::context::Clock;
use crate::error::{Result, SyncError};
use crate::payload::Payload;
use crate::store::{self, KeyValueStore};

/// Store table for queue items
pub const QUEUE_TABLE: &str = "sync_queue";

/// Default attempts before an item is parked as failed
pub const MAX_ATTEMPTS: u32 = 10;

/// Default delay after the first failure
pub const INITIAL_BACKOFF_MS: i64 = 1_000;

/// Default ceiling for the retry delay
pub const MAX_BACKOFF_SECS: i64 = 300;

/// Default retention for synced items: 7 days
pub const RETENTION_HOURS: i64 = 168;

/// Queue retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long synced items are kept before garbage collection
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_backoff: Duration::milliseconds(INITIAL_BACKOFF_MS),
            max_backoff: Duration::seconds(MAX_BACKOFF_SECS),
            retention: Duration::hours(RETENTION_HOURS),
        }
    }
}

/// A queued outbound operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub data: Payload,
    /// Lower is more urgent
    pub priority: u8,
    pub synced: bool,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Enqueue time
    pub timestamp: DateTime<Utc>,
    /// Enqueue order; strictly increasing per queue
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

/// Optional settings for [`SyncQueue::add_to_queue`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<u8>,
    pub data: Option<Payload>,
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

/// Persistent priority/retry queue
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    /// Next enqueue sequence, loaded from the store on first use
    next_sequence: Arc<Mutex<Option<u64>>>,
}

impl SyncQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
            next_sequence: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Delay before an item with `attempts` failures is eligible again
    ///
    /// `min(initial * 2^(attempts-1), max)`; zero before the first failure.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::zero();
        }
        let exponent = (attempts - 1).min(32);
        let millis = self
            .config
            .initial_backoff
            .num_milliseconds()
            .saturating_mul(1i64 << exponent);
        Duration::milliseconds(millis.min(self.config.max_backoff.num_milliseconds()))
    }

    fn is_failed(&self, item: &SyncQueueItem) -> bool {
        !item.synced && item.attempts >= self.config.max_attempts
    }

    /// Unsynced, not failed and outside its backoff window
    pub fn is_ready(&self, item: &SyncQueueItem, now: DateTime<Utc>) -> bool {
        if item.synced || self.is_failed(item) {
            return false;
        }
        match item.last_attempt {
            Some(last) if item.attempts > 0 => now >= last + self.backoff_delay(item.attempts),
            _ => true,
        }
    }

    async fn load_next_sequence(&self) -> Result<u64> {
        let items: Vec<SyncQueueItem> = store::decode_all(self.store.scan(QUEUE_TABLE).await?)?;
        Ok(items.iter().map(|item| item.sequence).max().map_or(1, |max| max + 1))
    }

    /// Enqueue an operation, returning the new item id
    pub async fn add_to_queue(
        &self,
        table: &str,
        record_id: &str,
        operation: Operation,
        options: EnqueueOptions,
    ) -> Result<String> {
        let mut next_sequence = self.next_sequence.lock().await;
        let sequence = match *next_sequence {
            Some(sequence) => sequence,
            None => self.load_next_sequence().await?,
        };

        let item = SyncQueueItem {
            id: Uuid::new_v4().to_string(),
            table_name: table.to_string(),
            record_id: record_id.to_string(),
            operation,
            data: options.data.unwrap_or_default(),
            priority: options.priority.unwrap_or_else(|| default_priority(table)),
            synced: false,
            attempts: 0,
            last_attempt: None,
            error: None,
            timestamp: self.clock.now(),
            sequence,
            synced_at: None,
        };

        store::save(self.store.as_ref(), QUEUE_TABLE, &item.id, &item).await?;
        *next_sequence = Some(sequence + 1);
        drop(next_sequence);

        tracing::debug!(
            item_id = %item.id,
            table = %table,
            record_id = %record_id,
            operation = ?operation,
            priority = item.priority,
            sequence = sequence,
            "Queued operation"
        );

        Ok(item.id)
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        store::load(self.store.as_ref(), QUEUE_TABLE, id).await
    }

    async fn require_item(&self, id: &str) -> Result<SyncQueueItem> {
        self.get_item(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("Queue item not found: {}", id)))
    }

    /// Every unsynced item, failed ones included, in enqueue order
    pub async fn get_unsynced_operations(&self) -> Result<Vec<SyncQueueItem>> {
        let rows = self
            .store
            .find_by(QUEUE_TABLE, "synced", &serde_json::Value::Bool(false))
            .await?;
        let mut items: Vec<SyncQueueItem> = store::decode_all(rows)?;
        items.sort_by_key(|item| item.sequence);
        Ok(items)
    }

    /// Unsynced items for one record, in enqueue order
    pub async fn unsynced_for_record(&self, table: &str, record_id: &str) -> Result<Vec<SyncQueueItem>> {
        Ok(self
            .get_unsynced_operations()
            .await?
            .into_iter()
            .filter(|item| item.table_name == table && item.record_id == record_id)
            .collect())
    }

    /// Items ready for upload: unsynced, not failed, outside their backoff
    /// window; ordered by priority, then enqueue time
    pub async fn get_pending_operations(&self, limit: Option<usize>) -> Result<Vec<SyncQueueItem>> {
        let now = self.clock.now();
        let mut items: Vec<SyncQueueItem> = self
            .get_unsynced_operations()
            .await?
            .into_iter()
            .filter(|item| self.is_ready(item, now))
            .collect();

        items.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.sequence.cmp(&b.sequence))
        });

        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    /// Items that exhausted their attempts
    pub async fn get_failed_operations(&self) -> Result<Vec<SyncQueueItem>> {
        let mut items: Vec<SyncQueueItem> = self
            .get_unsynced_operations()
            .await?
            .into_iter()
            .filter(|item| self.is_failed(item))
            .collect();
        items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.sequence.cmp(&b.sequence)));
        Ok(items)
    }

    pub async fn mark_as_synced(&self, id: &str) -> Result<()> {
        let mut item = self.require_item(id).await?;
        let now = self.clock.now();
        item.synced = true;
        item.synced_at = Some(now);
        item.last_attempt = Some(now);
        item.error = None;
        store::save(self.store.as_ref(), QUEUE_TABLE, id, &item).await
    }

    /// Record a failed attempt; the item stays queued
    pub async fn mark_as_failed(&self, id: &str, error: &str) -> Result<()> {
        let mut item = self.require_item(id).await?;
        item.attempts += 1;
        item.last_attempt = Some(self.clock.now());
        item.error = Some(error.to_string());
        store::save(self.store.as_ref(), QUEUE_TABLE, id, &item).await?;

        if self.is_failed(&item) {
            tracing::warn!(
                item_id = %id,
                table = %item.table_name,
                record_id = %item.record_id,
                attempts = item.attempts,
                error = %error,
                "Queue item permanently failed"
            );
        } else {
            tracing::debug!(
                item_id = %id,
                attempts = item.attempts,
                retry_in_ms = self.backoff_delay(item.attempts).num_milliseconds(),
                "Queue item attempt failed"
            );
        }
        Ok(())
    }

    /// Reset a failed item so it is pending again immediately
    pub async fn retry_failed_operation(&self, id: &str) -> Result<()> {
        let mut item = self.require_item(id).await?;
        if item.synced {
            return Err(SyncError::Validation(format!(
                "queue item {} is already synced",
                id
            )));
        }
        item.attempts = 0;
        item.last_attempt = None;
        item.error = None;
        store::save(self.store.as_ref(), QUEUE_TABLE, id, &item).await?;

        tracing::info!(item_id = %id, "Queue item readmitted");
        Ok(())
    }

    pub async fn retry_all_failed(&self) -> Result<usize> {
        let failed = self.get_failed_operations().await?;
        for item in &failed {
            self.retry_failed_operation(&item.id).await?;
        }
        Ok(failed.len())
    }

    /// Delete synced items older than the retention window
    pub async fn clear_synced(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.config.retention;
        let rows = self
            .store
            .find_by(QUEUE_TABLE, "synced", &serde_json::Value::Bool(true))
            .await?;

        let mut removed = 0;
        for item in store::decode_all::<SyncQueueItem>(rows)? {
            if item.synced_at.unwrap_or(item.timestamp) < cutoff
                && self.store.delete(QUEUE_TABLE, &item.id).await?
            {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed = removed, "Cleared synced queue items");
        }
        Ok(removed)
    }

    /// Mark every unsynced item for one record as synced
    ///
    /// Used when the authority already holds a version that includes them.
    pub async fn mark_record_synced(&self, table: &str, record_id: &str) -> Result<usize> {
        let items = self.unsynced_for_record(table, record_id).await?;
        for item in &items {
            self.mark_as_synced(&item.id).await?;
        }
        Ok(items.len())
    }

    pub async fn get_stats(&self) -> Result<QueueStats> {
        let items: Vec<SyncQueueItem> = store::decode_all(self.store.scan(QUEUE_TABLE).await?)?;

        let mut stats = QueueStats {
            total: items.len(),
            ..Default::default()
        };
        for item in &items {
            if item.synced {
                stats.synced += 1;
            } else if self.is_failed(item) {
                stats.failed += 1;
            } else {
                stats.pending += 1;
                stats.oldest_pending = Some(match stats.oldest_pending {
                    Some(oldest) => oldest.min(item.timestamp),
                    None => item.timestamp,
                });
            }
        }
        Ok(stats)
    }
}
