//! Hash-chained, append-only audit log

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::types::{
    AuditEntry, AuditQuery, ChainBreak, ChainBreakKind, ChainVerification, EventType, NewAuditEvent,
};
use crate::context::{Clock, SessionContext};
use crate::error::Result;
use crate::hashing::{hash_canonical, Hasher, ZERO_HASH};
use crate::payload::{merge_shallow, Payload};
use crate::store::KeyValueStore;

pub const AUDIT_TABLE: &str = "audit_log";

#[derive(Debug, Clone)]
struct ChainHead {
    sequence: u64,
    hash: String,
}

/// Append-only event stream for one tenant
///
/// Entries are keyed `{tenant}:{sequence:020}` so key order is sequence
/// order. Appends are serialized by a lock around the cached chain head.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn KeyValueStore>,
    hasher: Arc<dyn Hasher>,
    clock: Arc<dyn Clock>,
    context: SessionContext,
    head: Arc<Mutex<Option<ChainHead>>>,
}

impl AuditLog {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        hasher: Arc<dyn Hasher>,
        clock: Arc<dyn Clock>,
        context: SessionContext,
    ) -> Self {
        Self {
            store,
            hasher,
            clock,
            context,
            head: Arc::new(Mutex::new(None)),
        }
    }

    fn key(&self, sequence: u64) -> String {
        format!("{}:{:020}", self.context.tenant_id, sequence)
    }

    fn prefix(&self) -> String {
        format!("{}:", self.context.tenant_id)
    }

    async fn load_head(&self) -> Result<ChainHead> {
        let rows = self.store.scan_prefix(AUDIT_TABLE, &self.prefix()).await?;
        match rows.into_iter().last() {
            Some((_, doc)) => {
                let entry: AuditEntry = serde_json::from_value(doc)?;
                Ok(ChainHead {
                    sequence: entry.sequence,
                    hash: entry.hash,
                })
            }
            None => Ok(ChainHead {
                sequence: 0,
                hash: ZERO_HASH.to_string(),
            }),
        }
    }

    /// Append an event, chaining it to the current head
    pub async fn log_event(&self, event: NewAuditEvent) -> Result<AuditEntry> {
        let mut head = self.head.lock().await;
        let current = match head.as_ref() {
            Some(h) => h.clone(),
            None => self.load_head().await?,
        };

        let user_id = if event.user_id.is_empty() {
            self.context.user_id.clone()
        } else {
            event.user_id
        };

        let mut entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            sequence: current.sequence + 1,
            timestamp: self.clock.now(),
            tenant_id: self.context.tenant_id.clone(),
            user_id,
            device_id: self.context.device_id.clone(),
            event_type: event.event_type,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            data: event.data,
            metadata: event.metadata,
            previous_hash: current.hash,
            hash: String::new(),
        };
        entry.hash = hash_canonical(self.hasher.as_ref(), &entry.hash_input())?;

        self.store
            .put(AUDIT_TABLE, &self.key(entry.sequence), &serde_json::to_value(&entry)?)
            .await?;

        *head = Some(ChainHead {
            sequence: entry.sequence,
            hash: entry.hash.clone(),
        });

        tracing::debug!(
            sequence = entry.sequence,
            event_type = ?entry.event_type,
            aggregate = %format!("{}/{}", entry.aggregate_type, entry.aggregate_id),
            "Audit event logged"
        );
        Ok(entry)
    }

    /// All entries in sequence order
    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        let rows = self.store.scan_prefix(AUDIT_TABLE, &self.prefix()).await?;
        rows.into_iter()
            .map(|(_, doc)| Ok(serde_json::from_value(doc)?))
            .collect()
    }

    pub async fn len(&self) -> Result<u64> {
        let head = self.head.lock().await;
        match head.as_ref() {
            Some(h) => Ok(h.sequence),
            None => Ok(self.load_head().await?.sequence),
        }
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Entries touching one aggregate, in sequence order
    pub async fn entries_for_aggregate(&self, aggregate_type: &str, aggregate_id: &str) -> Result<Vec<AuditEntry>> {
        let prefix = self.prefix();
        let rows = self
            .store
            .find_by(AUDIT_TABLE, "aggregate_id", &serde_json::Value::String(aggregate_id.to_string()))
            .await?;

        let mut entries = Vec::new();
        for (key, doc) in rows {
            if !key.starts_with(&prefix) {
                continue;
            }
            let entry: AuditEntry = serde_json::from_value(doc)?;
            if entry.aggregate_type == aggregate_type {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| query.matches(e))
            .collect();
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Walk the whole stream and report every break found
    pub async fn verify_hash_chain(&self) -> Result<ChainVerification> {
        let rows = self.store.scan_prefix(AUDIT_TABLE, &self.prefix()).await?;

        let mut errors = Vec::new();
        let mut expected_sequence = 1u64;
        let mut previous_hash = ZERO_HASH.to_string();

        for (key, doc) in &rows {
            let entry: AuditEntry = match serde_json::from_value(doc.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    errors.push(ChainBreak {
                        sequence: expected_sequence,
                        kind: ChainBreakKind::Malformed,
                        message: format!("{}: {}", key, e),
                    });
                    expected_sequence += 1;
                    continue;
                }
            };

            if entry.sequence != expected_sequence {
                errors.push(ChainBreak {
                    sequence: entry.sequence,
                    kind: ChainBreakKind::SequenceGap,
                    message: format!("expected sequence {}, found {}", expected_sequence, entry.sequence),
                });
            }

            if entry.previous_hash != previous_hash {
                errors.push(ChainBreak {
                    sequence: entry.sequence,
                    kind: ChainBreakKind::BrokenLink,
                    message: format!("previous_hash {} does not match {}", entry.previous_hash, previous_hash),
                });
            }

            let actual = hash_canonical(self.hasher.as_ref(), &entry.hash_input())?;
            if actual != entry.hash {
                errors.push(ChainBreak {
                    sequence: entry.sequence,
                    kind: ChainBreakKind::HashMismatch,
                    message: format!("stored hash {} but contents hash to {}", entry.hash, actual),
                });
            }

            previous_hash = entry.hash;
            expected_sequence = entry.sequence + 1;
        }

        if !errors.is_empty() {
            tracing::warn!(
                tenant = %self.context.tenant_id,
                breaks = errors.len(),
                "Audit chain verification failed"
            );
        }

        Ok(ChainVerification {
            valid: errors.is_empty(),
            entries_checked: rows.len(),
            errors,
        })
    }

    /// Replay an aggregate's events up to `as_of` (inclusive)
    ///
    /// Returns `None` if the aggregate never existed or was deleted.
    pub async fn reconstruct_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<Payload>> {
        let mut state: Option<Payload> = None;

        for entry in self.entries_for_aggregate(aggregate_type, aggregate_id).await? {
            if as_of.map_or(false, |t| entry.timestamp > t) {
                break;
            }
            state = match entry.event_type {
                EventType::Create => Some(entry.data),
                EventType::Update => Some(merge_shallow(&state.unwrap_or_default(), &entry.data)),
                EventType::Delete => None,
                _ => state,
            };
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use crate::hashing::Sha256Hasher;
    use crate::payload::{from_json, FieldValue};
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn setup() -> (AuditLog, Arc<MemoryStore>, ManualClock) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
        let log = AuditLog::new(
            store.clone(),
            Arc::new(Sha256Hasher),
            Arc::new(clock.clone()),
            SessionContext::new("t1", "device-a", "u1"),
        );
        (log, store, clock)
    }

    fn event(event_type: EventType, id: &str, data: serde_json::Value) -> NewAuditEvent {
        NewAuditEvent::new(event_type, "clients", id, from_json(data).unwrap())
    }

    #[tokio::test]
    async fn test_chain_links_entries() {
        let (log, _, _) = setup();
        let first = log.log_event(event(EventType::Create, "c-1", json!({"nombre": "A"}))).await.unwrap();
        let second = log.log_event(event(EventType::Update, "c-1", json!({"nombre": "B"}))).await.unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(first.previous_hash, ZERO_HASH);
        assert_eq!(second.previous_hash, first.hash);
        assert_eq!(first.user_id, "u1");
        assert_eq!(log.len().await.unwrap(), 2);

        let report = log.verify_hash_chain().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 2);
    }

    #[tokio::test]
    async fn test_head_reloaded_from_store() {
        let (log, store, clock) = setup();
        log.log_event(event(EventType::Create, "c-1", json!({"nombre": "A"}))).await.unwrap();

        let reopened = AuditLog::new(
            store,
            Arc::new(Sha256Hasher),
            Arc::new(clock),
            SessionContext::new("t1", "device-a", "u1"),
        );
        let next = reopened.log_event(event(EventType::Update, "c-1", json!({"nombre": "B"}))).await.unwrap();
        assert_eq!(next.sequence, 2);
        assert!(reopened.verify_hash_chain().await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_tampered_data_detected_without_short_circuit() {
        let (log, store, _) = setup();
        for i in 0..4 {
            log.log_event(event(EventType::Update, "c-1", json!({"n": i}))).await.unwrap();
        }

        let key = log.key(2);
        let mut doc = store.get(AUDIT_TABLE, &key).await.unwrap().unwrap();
        doc["data"]["n"] = json!(99);
        store.put(AUDIT_TABLE, &key, &doc).await.unwrap();

        let key = log.key(4);
        let mut doc = store.get(AUDIT_TABLE, &key).await.unwrap().unwrap();
        doc["previous_hash"] = json!(ZERO_HASH);
        store.put(AUDIT_TABLE, &key, &doc).await.unwrap();

        let report = log.verify_hash_chain().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.entries_checked, 4);

        let found: Vec<(u64, ChainBreakKind)> = report.errors.iter().map(|b| (b.sequence, b.kind)).collect();
        assert!(found.contains(&(2, ChainBreakKind::HashMismatch)));
        assert!(found.contains(&(4, ChainBreakKind::BrokenLink)));
        assert!(found.contains(&(4, ChainBreakKind::HashMismatch)));
        assert!(!found.iter().any(|(seq, _)| *seq == 3));
    }

    #[tokio::test]
    async fn test_missing_entry_is_a_gap() {
        let (log, store, _) = setup();
        for i in 0..3 {
            log.log_event(event(EventType::Update, "c-1", json!({"n": i}))).await.unwrap();
        }
        store.delete(AUDIT_TABLE, &log.key(2)).await.unwrap();

        let report = log.verify_hash_chain().await.unwrap();
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|b| b.sequence == 3 && b.kind == ChainBreakKind::SequenceGap));
    }

    #[tokio::test]
    async fn test_reconstruct_state_replays_to_point_in_time() {
        let (log, _, clock) = setup();
        let t0 = clock.now();
        log.log_event(event(EventType::Create, "c-1", json!({"nombre": "A", "zona": "sur"}))).await.unwrap();
        clock.advance(Duration::minutes(1));
        let t1 = clock.now();
        log.log_event(event(EventType::Update, "c-1", json!({"nombre": "B"}))).await.unwrap();
        clock.advance(Duration::minutes(1));
        let t2 = clock.now();
        log.log_event(event(EventType::Delete, "c-1", json!({}))).await.unwrap();
        // Unrelated aggregate does not leak in
        log.log_event(event(EventType::Create, "c-2", json!({"nombre": "Z"}))).await.unwrap();

        let at_t0 = log.reconstruct_state("clients", "c-1", Some(t0)).await.unwrap().unwrap();
        assert_eq!(at_t0["nombre"], FieldValue::from("A"));

        let at_t1 = log.reconstruct_state("clients", "c-1", Some(t1)).await.unwrap().unwrap();
        assert_eq!(at_t1["nombre"], FieldValue::from("B"));
        assert_eq!(at_t1["zona"], FieldValue::from("sur"));

        assert!(log.reconstruct_state("clients", "c-1", Some(t2)).await.unwrap().is_none());
        assert!(log.reconstruct_state("clients", "c-1", None).await.unwrap().is_none());
        assert!(log.reconstruct_state("clients", "missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_filters() {
        let (log, _, _) = setup();
        log.log_event(event(EventType::Create, "c-1", json!({"nombre": "A"}))).await.unwrap();
        log.log_event(event(EventType::Update, "c-1", json!({"nombre": "B"})).by_user("u2"))
            .await
            .unwrap();
        log.log_event(NewAuditEvent::new(EventType::Sync, "sync", "run", Payload::new()))
            .await
            .unwrap();

        let updates = log
            .query(&AuditQuery {
                event_type: Some(EventType::Update),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].user_id, "u2");

        let clients = log
            .query(&AuditQuery {
                aggregate_type: Some("clients".to_string()),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].sequence, 1);
    }
}
