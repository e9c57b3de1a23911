//! Local change tracking
//!
//! Applies local mutations to stored records (version vector and field
//! versions included), queues them, and later folds the queued operations
//! into per-table upload batches.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use super::queue::{EnqueueOptions, SyncQueue, SyncQueueItem};
use super::types::{validate_user_fields, FieldVersion, Operation, SyncableRecord};
use super::version::VersionVector;
use crate::context::{Clock, SessionContext};
use crate::error::{Result, SyncError};
use crate::payload::{merge_shallow, Payload};
use crate::store::KeyValueStore;

/// A local mutation applied to its record but not yet persisted
#[derive(Debug, Clone)]
pub struct StagedChange {
    pub table: String,
    pub operation: Operation,
    /// Fields touched by this mutation
    pub delta: Payload,
    pub record: SyncableRecord,
    /// Stored record before this mutation
    pub previous: Option<SyncableRecord>,
}

/// One record's compressed changes, as pushed to the remote authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundChange {
    pub record_id: String,
    pub operation: Operation,
    /// Latest value per changed field
    pub delta: Payload,
    pub version_vector: VersionVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<SyncableRecord>,
}

/// Changes for one table, uploaded together
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub table: String,
    pub priority: u8,
    pub changes: Vec<OutboundChange>,
    /// Queue items folded into this batch
    pub item_ids: Vec<String>,
}

/// Collects local mutations and batches them for upload
#[derive(Clone)]
pub struct ChangeTracker {
    store: Arc<dyn KeyValueStore>,
    queue: SyncQueue,
    clock: Arc<dyn Clock>,
    context: SessionContext,
}

impl ChangeTracker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        queue: SyncQueue,
        clock: Arc<dyn Clock>,
        context: SessionContext,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            context,
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub async fn load_record(&self, table: &str, record_id: &str) -> Result<Option<SyncableRecord>> {
        match self.store.get(table, record_id).await? {
            Some(doc) => Ok(Some(SyncableRecord::from_document(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn save_record(&self, table: &str, record: &SyncableRecord) -> Result<()> {
        self.store.put(table, &record.id, &record.to_document()?).await
    }

    /// Records in `table` with local changes the authority has not seen
    pub async fn unsynced_records(&self, table: &str) -> Result<Vec<SyncableRecord>> {
        self.store
            .find_by(table, "synced", &serde_json::Value::Bool(false))
            .await?
            .into_iter()
            .map(|(_, doc)| SyncableRecord::from_document(doc))
            .collect()
    }

    /// Apply a local mutation to the current record without persisting it
    pub async fn stage_change(
        &self,
        table: &str,
        record_id: &str,
        operation: Operation,
        fields: Payload,
    ) -> Result<StagedChange> {
        validate_user_fields(&fields)?;
        let now = self.clock.now();
        let device = &self.context.device_id;

        let previous = self.load_record(table, record_id).await?;
        let (operation, record) = match (previous.clone(), operation) {
            (None, Operation::Delete) => {
                return Err(SyncError::NotFound(format!("{}/{}", table, record_id)));
            }
            (None, _) => {
                let record = SyncableRecord::new(record_id, &self.context.tenant_id, device, fields.clone(), now);
                (Operation::Insert, record)
            }
            (Some(existing), Operation::Insert) if !existing.deleted => {
                return Err(SyncError::Validation(format!(
                    "{}/{} already exists",
                    table, record_id
                )));
            }
            (Some(existing), Operation::Update) if existing.deleted => {
                return Err(SyncError::Validation(format!(
                    "{}/{} is deleted; insert it again to restore it",
                    table, record_id
                )));
            }
            (Some(mut record), op) => {
                for (name, value) in &fields {
                    record.fields.insert(name.clone(), value.clone());
                    record
                        .field_versions
                        .insert(name.clone(), FieldVersion::new(value.clone(), device, now));
                }
                record.deleted = op == Operation::Delete;
                record.version_vector = record.version_vector.incremented(device);
                record.synced = false;
                record.updated_at = now;
                (op, record)
            }
        };

        Ok(StagedChange {
            table: table.to_string(),
            operation,
            delta: fields,
            record,
            previous,
        })
    }

    /// Persist a staged record
    pub async fn persist(&self, staged: &StagedChange) -> Result<()> {
        self.save_record(&staged.table, &staged.record).await
    }

    /// Put the stored record back the way it was before `staged`
    pub async fn revert(&self, staged: &StagedChange) -> Result<()> {
        match &staged.previous {
            Some(previous) => self.save_record(&staged.table, previous).await,
            None => self.store.delete(&staged.table, &staged.record.id).await.map(|_| ()),
        }
    }

    /// Queue a persisted change for upload
    pub async fn enqueue(&self, staged: &StagedChange) -> Result<String> {
        self.queue
            .add_to_queue(
                &staged.table,
                &staged.record.id,
                staged.operation,
                EnqueueOptions {
                    priority: None,
                    data: Some(staged.delta.clone()),
                },
            )
            .await
    }

    /// Fold pending queue items into per-table batches, most urgent first
    ///
    /// A record goes out with all of its queued items or not at all: while any
    /// of them waits out a backoff window or is parked as failed, the whole
    /// record waits. `limit` caps the number of records.
    pub async fn pending_batches(&self, limit: Option<usize>) -> Result<Vec<ChangeBatch>> {
        let now = self.clock.now();

        let mut per_record: HashMap<(String, String), Vec<SyncQueueItem>> = HashMap::new();
        for item in self.queue.get_unsynced_operations().await? {
            per_record
                .entry((item.table_name.clone(), item.record_id.clone()))
                .or_default()
                .push(item);
        }

        let mut ready: Vec<((String, String), Vec<SyncQueueItem>)> = Vec::new();
        for (key, items) in per_record {
            if items.iter().all(|item| self.queue.is_ready(item, now)) {
                ready.push((key, items));
            } else {
                tracing::debug!(
                    table = %key.0,
                    record_id = %key.1,
                    queued = items.len(),
                    "Record held back until all its queued items are ready"
                );
            }
        }

        // Items are in enqueue order, so the first one is the oldest
        ready.sort_by_key(|(_, items)| {
            let oldest = &items[0];
            (min_priority(items), oldest.timestamp, oldest.sequence)
        });
        if let Some(limit) = limit {
            ready.truncate(limit);
        }

        let mut batches: Vec<ChangeBatch> = Vec::new();
        for ((table, record_id), items) in ready {
            let priority = min_priority(&items);
            let change = self.compress(&table, &record_id, &items).await?;

            let idx = match batches.iter().position(|batch| batch.table == table) {
                Some(idx) => idx,
                None => {
                    batches.push(ChangeBatch {
                        table: table.clone(),
                        priority,
                        changes: Vec::new(),
                        item_ids: Vec::new(),
                    });
                    batches.len() - 1
                }
            };
            let batch = &mut batches[idx];
            batch.priority = batch.priority.min(priority);
            batch.item_ids.extend(items.into_iter().map(|item| item.id));
            batch.changes.push(change);
        }

        // Stable: equal priorities keep first-seen order
        batches.sort_by_key(|batch| batch.priority);
        Ok(batches)
    }

    /// Collapse one record's queued operations into a single delta per field
    async fn compress(&self, table: &str, record_id: &str, items: &[SyncQueueItem]) -> Result<OutboundChange> {
        let mut operation = items[0].operation;
        let mut delta = items[0].data.clone();
        for item in &items[1..] {
            operation = operation.then(item.operation);
            delta = merge_shallow(&delta, &item.data);
        }

        let record = self.load_record(table, record_id).await?;
        // The folded operation follows the stored tombstone
        if let Some(record) = &record {
            if record.deleted {
                operation = Operation::Delete;
            } else if operation == Operation::Delete {
                operation = match items[0].operation {
                    Operation::Insert => Operation::Insert,
                    _ => Operation::Update,
                };
            }
        }

        let version_vector = record
            .as_ref()
            .map(|r| r.version_vector.clone())
            .unwrap_or_default();

        Ok(OutboundChange {
            record_id: record_id.to_string(),
            operation,
            delta,
            version_vector,
            record,
        })
    }

    /// Mark a pushed batch as synced
    ///
    /// A record edited again after the batch was built keeps `synced=false`
    /// while its newer change is still queued.
    pub async fn mark_batch_synced(&self, batch: &ChangeBatch) -> Result<()> {
        try_join_all(batch.item_ids.iter().map(|id| self.queue.mark_as_synced(id))).await?;

        for change in &batch.changes {
            let Some(mut record) = self.load_record(&batch.table, &change.record_id).await? else {
                continue;
            };
            if record.synced || record.version_vector != change.version_vector {
                continue;
            }
            if !self
                .queue
                .unsynced_for_record(&batch.table, &change.record_id)
                .await?
                .is_empty()
            {
                continue;
            }
            record.synced = true;
            self.save_record(&batch.table, &record).await?;
        }
        Ok(())
    }

    /// Hand a failed batch back to the queue's backoff
    pub async fn mark_batch_failed(&self, batch: &ChangeBatch, error: &str) -> Result<()> {
        try_join_all(batch.item_ids.iter().map(|id| self.queue.mark_as_failed(id, error))).await?;
        Ok(())
    }
}

fn min_priority(items: &[SyncQueueItem]) -> u8 {
    items.iter().map(|item| item.priority).min().unwrap_or(u8::MAX)
}
