//! Sync data types
//!
//! Defines types for multi-device synchronization including:
//! - Syncable records with version vectors and per-field versions
//! - Queue operations and table priority classes
//! - Remote deltas and sync run reports

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::queue::QueueStats;
use super::version::VersionVector;
use crate::error::{Result, SyncError};
use crate::payload::{FieldValue, Payload};

/// Record metadata keys; user fields may not use these names
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "tenant_id",
    "version_vector",
    "field_versions",
    "checksum",
    "synced",
    "deleted",
    "created_at",
    "updated_at",
];

/// Last writer of a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldVersion {
    pub value: FieldValue,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
}

impl FieldVersion {
    pub fn new(value: FieldValue, device_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            timestamp,
            device_id: device_id.to_string(),
        }
    }
}

/// A record that can be mutated offline on many devices
///
/// Stored flat: user fields sit next to the metadata keys in one document.
/// Records are never physically removed; `deleted` is the tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub id: String,
    pub tenant_id: String,
    pub version_vector: VersionVector,
    #[serde(default)]
    pub field_versions: BTreeMap<String, FieldVersion>,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Payload,
}

impl SyncableRecord {
    /// A record on its first local write
    pub fn new(id: &str, tenant_id: &str, device_id: &str, fields: Payload, now: DateTime<Utc>) -> Self {
        let field_versions = fields
            .iter()
            .map(|(name, value)| (name.clone(), FieldVersion::new(value.clone(), device_id, now)))
            .collect();

        Self {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            version_vector: VersionVector::initial(device_id),
            field_versions,
            checksum: String::new(),
            synced: false,
            deleted: false,
            created_at: now,
            updated_at: now,
            fields,
        }
    }

    /// Decode a stored document
    pub fn from_document(doc: serde_json::Value) -> Result<Self> {
        serde_json::from_value(doc).map_err(|e| SyncError::Validation(format!("malformed record: {}", e)))
    }

    pub fn to_document(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Reject user fields that would shadow record metadata
pub fn validate_user_fields(fields: &Payload) -> Result<()> {
    match fields.keys().find(|k| RESERVED_FIELDS.contains(&k.as_str())) {
        Some(reserved) => Err(SyncError::Validation(format!(
            "field '{}' is reserved for record metadata",
            reserved
        ))),
        None => Ok(()),
    }
}

/// Types of queued operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Fold a later operation on the same record into this one
    pub fn then(self, later: Operation) -> Operation {
        match (self, later) {
            (_, Operation::Delete) => Operation::Delete,
            (Operation::Insert, Operation::Update) => Operation::Insert,
            (Operation::Delete, Operation::Update) => Operation::Update,
            (_, later) => later,
        }
    }
}

/// Upload class of a table; lower sorts first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableClass {
    /// Ledger and transaction entries: the source of truth for money
    Ledger = 1,
    /// Aggregates that hang off a primary entity
    Dependent = 2,
    /// Primary business entities
    Primary = 3,
    Other = 4,
}

const TABLE_CLASSES: &[(&str, TableClass)] = &[
    ("payments", TableClass::Ledger),
    ("transactions", TableClass::Ledger),
    ("credits", TableClass::Dependent),
    ("installments", TableClass::Dependent),
    ("clients", TableClass::Primary),
    ("products", TableClass::Primary),
];

pub fn table_class(table: &str) -> TableClass {
    TABLE_CLASSES
        .iter()
        .find(|(name, _)| *name == table)
        .map(|(_, class)| *class)
        .unwrap_or(TableClass::Other)
}

/// Default queue priority for a table
pub fn default_priority(table: &str) -> u8 {
    table_class(table) as u8
}

/// Ledger-like entities are written once and never merged field by field
pub fn is_append_only(table: &str) -> bool {
    table_class(table) == TableClass::Ledger
}

/// Writer recorded for remote fields that arrive without a field version
pub const REMOTE_DEVICE: &str = "remote";

/// A change fetched from the remote authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDelta {
    pub table: String,
    pub record_id: String,
    pub new_value: Payload,
    pub vector: VersionVector,
    #[serde(default)]
    pub field_versions: BTreeMap<String, FieldVersion>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteDelta {
    /// Reject deltas that cannot be applied to a stored record
    pub fn validate(&self) -> Result<()> {
        if self.vector.is_empty() {
            return Err(SyncError::Validation("remote change has no version vector".to_string()));
        }
        validate_user_fields(&self.new_value)
    }

    /// The remote side of a record as the resolver sees it
    ///
    /// Fields the authority sent without version metadata are stamped with
    /// the delta's write time.
    pub fn to_record(&self, tenant_id: &str, now: DateTime<Utc>) -> SyncableRecord {
        let updated_at = self.updated_at.unwrap_or(now);
        let mut field_versions = self.field_versions.clone();
        for (name, value) in &self.new_value {
            field_versions
                .entry(name.clone())
                .or_insert_with(|| FieldVersion::new(value.clone(), REMOTE_DEVICE, updated_at));
        }

        SyncableRecord {
            id: self.record_id.clone(),
            tenant_id: tenant_id.to_string(),
            version_vector: self.vector.clone(),
            field_versions,
            checksum: String::new(),
            synced: true,
            deleted: self.deleted,
            created_at: updated_at,
            updated_at,
            fields: self.new_value.clone(),
        }
    }
}

/// Phase of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Upload,
    Download,
    Verify,
    Complete,
}

/// Progress update delivered at phase boundaries and between units of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

/// Outcome of one `sync()` run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub success: bool,
    pub uploaded: usize,
    pub downloaded: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SyncReport {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            success: false,
            uploaded: 0,
            downloaded: 0,
            conflicts: 0,
            errors: Vec::new(),
            timestamp,
            cancelled: false,
            message: None,
        }
    }

    /// A run that was refused before doing any work
    pub fn rejected(timestamp: DateTime<Utc>, message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::empty(timestamp)
        }
    }
}

/// Sync status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub online: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub queue: QueueStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::from_json;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_new_record_versioning() {
        let fields = from_json(json!({"nombre": "A", "telefono": "555"})).unwrap();
        let record = SyncableRecord::new("c-1", "t1", "device-1", fields, now());

        assert_eq!(record.version_vector.get("device-1"), 1);
        assert_eq!(record.field_versions.len(), 2);
        assert_eq!(record.field_versions["nombre"].device_id, "device-1");
        assert!(!record.synced);
        assert!(!record.deleted);
    }

    #[test]
    fn test_record_document_is_flat() {
        let fields = from_json(json!({"nombre": "A"})).unwrap();
        let record = SyncableRecord::new("c-1", "t1", "device-1", fields, now());

        let doc = record.to_document().unwrap();
        assert_eq!(doc["nombre"], "A");
        assert_eq!(doc["version_vector"], json!({"device-1": 1}));

        let back = SyncableRecord::from_document(doc).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_missing_vector_is_malformed() {
        let doc = json!({
            "id": "c-1",
            "tenant_id": "t1",
            "created_at": "2024-05-01T08:00:00Z",
            "updated_at": "2024-05-01T08:00:00Z"
        });
        assert!(matches!(SyncableRecord::from_document(doc), Err(SyncError::Validation(_))));
    }

    #[test]
    fn test_reserved_fields_rejected() {
        let fields = from_json(json!({"synced": true})).unwrap();
        assert!(validate_user_fields(&fields).is_err());
        let fields = from_json(json!({"nombre": "ok"})).unwrap();
        assert!(validate_user_fields(&fields).is_ok());
    }

    #[test]
    fn test_operation_folding() {
        assert_eq!(Operation::Insert.then(Operation::Update), Operation::Insert);
        assert_eq!(Operation::Update.then(Operation::Update), Operation::Update);
        assert_eq!(Operation::Insert.then(Operation::Delete), Operation::Delete);
        // A later write revives the record
        assert_eq!(Operation::Delete.then(Operation::Update), Operation::Update);
        assert_eq!(Operation::Delete.then(Operation::Insert), Operation::Insert);
    }

    #[test]
    fn test_remote_delta_stamps_unversioned_fields() {
        let written = now();
        let delta = RemoteDelta {
            table: "clients".to_string(),
            record_id: "c-1".to_string(),
            new_value: from_json(json!({"zone": "south"})).unwrap(),
            vector: VersionVector::from([("device-b", 1)]),
            field_versions: BTreeMap::new(),
            deleted: false,
            updated_at: Some(written),
        };

        let record = delta.to_record("t1", written + chrono::Duration::hours(1));
        assert!(record.synced);
        assert_eq!(record.updated_at, written);
        assert_eq!(record.field_versions["zone"].device_id, REMOTE_DEVICE);
        assert_eq!(record.field_versions["zone"].timestamp, written);
    }

    #[test]
    fn test_remote_delta_with_metadata_keys_rejected() {
        let mut delta = RemoteDelta {
            table: "clients".to_string(),
            record_id: "c-1".to_string(),
            new_value: from_json(json!({"name": "R", "id": "other", "deleted": true})).unwrap(),
            vector: VersionVector::from([("device-b", 1)]),
            field_versions: BTreeMap::new(),
            deleted: false,
            updated_at: None,
        };
        assert!(matches!(delta.validate(), Err(SyncError::Validation(_))));

        delta.new_value = from_json(json!({"name": "R"})).unwrap();
        assert!(delta.validate().is_ok());

        delta.vector = VersionVector::default();
        assert!(matches!(delta.validate(), Err(SyncError::Validation(_))));
    }

    #[test]
    fn test_table_priorities() {
        assert_eq!(default_priority("payments"), 1);
        assert_eq!(default_priority("credits"), 2);
        assert_eq!(default_priority("clients"), 3);
        assert_eq!(default_priority("notes"), 4);
        assert!(is_append_only("transactions"));
        assert!(!is_append_only("clients"));
    }
}
