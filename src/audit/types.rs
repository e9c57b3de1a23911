//! Audit log types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, SyncError};
use crate::payload::Payload;

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Create,
    Update,
    Delete,
    Login,
    Logout,
    Sync,
    Error,
    ConflictResolved,
    IntegrityRepair,
}

/// Event as submitted by a caller; the log fills in the rest
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEvent {
    pub user_id: String,
    pub event_type: EventType,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub data: Payload,
    pub metadata: Payload,
}

impl NewAuditEvent {
    pub fn new(event_type: EventType, aggregate_type: &str, aggregate_id: &str, data: Payload) -> Self {
        Self {
            user_id: String::new(),
            event_type,
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            data,
            metadata: Payload::new(),
        }
    }

    pub fn by_user(mut self, user_id: &str) -> Self {
        self.user_id = user_id.to_string();
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One persisted, hash-chained event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    /// 1-based position in the tenant's stream
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: String,
    pub event_type: EventType,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub data: Payload,
    #[serde(default)]
    pub metadata: Payload,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Every field except `id` and `hash` itself
    pub fn hash_input(&self) -> Value {
        json!({
            "sequence": self.sequence,
            "timestamp": self.timestamp,
            "tenant_id": self.tenant_id,
            "user_id": self.user_id,
            "device_id": self.device_id,
            "event_type": self.event_type,
            "aggregate_type": self.aggregate_type,
            "aggregate_id": self.aggregate_id,
            "data": self.data,
            "metadata": self.metadata,
            "previous_hash": self.previous_hash,
        })
    }
}

/// What went wrong at one position of the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainBreakKind {
    /// Stored hash does not match the entry's contents
    HashMismatch,
    /// `previous_hash` does not match the prior entry's hash
    BrokenLink,
    /// Sequence numbers are not contiguous
    SequenceGap,
    /// Entry could not be decoded
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub sequence: u64,
    pub kind: ChainBreakKind,
    pub message: String,
}

/// Result of walking a tenant's audit stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries_checked: usize,
    pub errors: Vec<ChainBreak>,
}

impl ChainVerification {
    /// Surface a broken chain as an integrity error
    pub fn ensure_valid(self) -> Result<Self> {
        if let Some(first) = self.errors.first() {
            return Err(SyncError::Integrity(format!(
                "audit chain broken at sequence {}: {} ({} breaks total)",
                first.sequence,
                first.message,
                self.errors.len()
            )));
        }
        Ok(self)
    }
}

/// Filter for [`super::AuditLog::query`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub event_type: Option<EventType>,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub user_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.event_type.map_or(true, |t| entry.event_type == t)
            && self.aggregate_type.as_deref().map_or(true, |t| entry.aggregate_type == t)
            && self.aggregate_id.as_deref().map_or(true, |id| entry.aggregate_id == id)
            && self.user_id.as_deref().map_or(true, |u| entry.user_id == u)
            && self.from.map_or(true, |from| entry.timestamp >= from)
            && self.to.map_or(true, |to| entry.timestamp <= to)
    }
}
