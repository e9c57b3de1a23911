//! Record checksums and integrity scans

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Clock;
use crate::error::{Result, SyncError};
use crate::hashing::{hash_canonical, validate_digest, Hasher};
use crate::store::KeyValueStore;
use crate::sync::SyncableRecord;

pub const CHECKSUM_TABLE: &str = "checksums";

/// Record metadata that never contributes to a checksum
const SYNC_METADATA: &[&str] = &["checksum", "synced", "version_vector", "field_versions", "updated_at"];

/// Fields that change without producing a new logical version
///
/// Listed per entity; anything not listed here is covered by the checksum.
pub const MUTABLE_FIELDS: &[(&str, &[&str])] = &[
    ("clients", &["balance", "last_visit_at", "status"]),
    ("credits", &["balance", "paid_installments", "days_overdue", "status"]),
    ("installments", &["paid_amount", "paid_at", "status"]),
    ("payments", &["sync_attempts"]),
    ("transactions", &[]),
    ("products", &["stock"]),
    ("visits", &["status"]),
];

/// Every table the integrity scan covers
pub fn checksummed_tables() -> impl Iterator<Item = &'static str> {
    MUTABLE_FIELDS.iter().map(|(table, _)| *table)
}

pub fn mutable_fields(record_type: &str) -> &'static [&'static str] {
    MUTABLE_FIELDS
        .iter()
        .find(|(table, _)| *table == record_type)
        .map(|(_, fields)| *fields)
        .unwrap_or(&[])
}

/// Cached checksum for one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumEntry {
    pub record_type: String,
    pub record_id: String,
    pub checksum: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumVerification {
    pub valid: bool,
    pub corrupted: bool,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityError {
    pub record_type: String,
    pub record_id: String,
}

/// Outcome of a full integrity scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub total: usize,
    pub valid: usize,
    pub corrupted: usize,
    pub missing: usize,
    pub repaired: usize,
    pub errors: Vec<IntegrityError>,
}

/// Canonical content hashing for stored records
#[derive(Clone)]
pub struct ChecksumService {
    store: Arc<dyn KeyValueStore>,
    hasher: Arc<dyn Hasher>,
    clock: Arc<dyn Clock>,
}

impl ChecksumService {
    pub fn new(store: Arc<dyn KeyValueStore>, hasher: Arc<dyn Hasher>, clock: Arc<dyn Clock>) -> Self {
        Self { store, hasher, clock }
    }

    /// Digest of `obj` minus its checksum, sync metadata and `mutable` fields
    pub fn calculate_checksum(&self, obj: &Value, mutable: &[&str]) -> Result<String> {
        let Value::Object(map) = obj else {
            return Err(SyncError::Validation("checksum input must be a JSON object".to_string()));
        };

        let content: serde_json::Map<String, Value> = map
            .iter()
            .filter(|(key, _)| !SYNC_METADATA.contains(&key.as_str()) && !mutable.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        hash_canonical(self.hasher.as_ref(), &Value::Object(content))
    }

    /// Checksum of a stored document using its entity's mutable-field list
    pub fn calculate_document_checksum(&self, record_type: &str, doc: &Value) -> Result<String> {
        self.calculate_checksum(doc, mutable_fields(record_type))
    }

    pub fn calculate_record_checksum(&self, record_type: &str, record: &SyncableRecord) -> Result<String> {
        self.calculate_document_checksum(record_type, &record.to_document()?)
    }

    pub fn calculate_client_checksum(&self, client: &Value) -> Result<String> {
        self.calculate_document_checksum("clients", client)
    }

    pub fn calculate_credit_checksum(&self, credit: &Value) -> Result<String> {
        self.calculate_document_checksum("credits", credit)
    }

    pub fn calculate_installment_checksum(&self, installment: &Value) -> Result<String> {
        self.calculate_document_checksum("installments", installment)
    }

    pub fn calculate_payment_checksum(&self, payment: &Value) -> Result<String> {
        self.calculate_document_checksum("payments", payment)
    }

    pub async fn load_document(&self, record_type: &str, record_id: &str) -> Result<Option<Value>> {
        self.store.get(record_type, record_id).await
    }

    /// Compare a document's stored checksum with its recomputed one
    pub fn verify_checksum(&self, record_type: &str, doc: &Value) -> Result<ChecksumVerification> {
        let expected = doc.get("checksum").and_then(Value::as_str).unwrap_or_default().to_string();
        let actual = self.calculate_document_checksum(record_type, doc)?;
        let valid = expected == actual;

        Ok(ChecksumVerification {
            valid,
            corrupted: !valid,
            expected,
            actual,
        })
    }

    /// Scan every checksummed table
    ///
    /// Records without a checksum get one written back. Mismatches are
    /// reported and left untouched.
    pub async fn perform_integrity_check(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();

        for table in checksummed_tables() {
            for (id, mut doc) in self.store.scan(table).await? {
                report.total += 1;

                let stored = doc.get("checksum").and_then(Value::as_str).unwrap_or_default();
                if stored.is_empty() {
                    report.missing += 1;
                    let checksum = match self.calculate_document_checksum(table, &doc) {
                        Ok(checksum) => checksum,
                        Err(e) => {
                            tracing::warn!(table = %table, record_id = %id, error = %e, "Cannot checksum record");
                            report.errors.push(IntegrityError {
                                record_type: table.to_string(),
                                record_id: id,
                            });
                            continue;
                        }
                    };
                    doc["checksum"] = Value::String(checksum.clone());
                    self.store.put(table, &id, &doc).await?;
                    self.store_checksum(table, &id, &checksum).await?;
                    report.repaired += 1;
                    tracing::info!(table = %table, record_id = %id, "Repaired missing checksum");
                    continue;
                }

                match self.verify_checksum(table, &doc) {
                    Ok(v) if v.valid => report.valid += 1,
                    Ok(v) => {
                        report.corrupted += 1;
                        tracing::warn!(
                            table = %table,
                            record_id = %id,
                            expected = %v.expected,
                            actual = %v.actual,
                            "Checksum mismatch"
                        );
                        report.errors.push(IntegrityError {
                            record_type: table.to_string(),
                            record_id: id,
                        });
                    }
                    Err(e) => {
                        report.corrupted += 1;
                        tracing::warn!(table = %table, record_id = %id, error = %e, "Cannot verify record");
                        report.errors.push(IntegrityError {
                            record_type: table.to_string(),
                            record_id: id,
                        });
                    }
                }
            }
        }

        tracing::info!(
            total = report.total,
            valid = report.valid,
            corrupted = report.corrupted,
            repaired = report.repaired,
            "Integrity check complete"
        );
        Ok(report)
    }

    fn cache_key(record_type: &str, record_id: &str) -> String {
        format!("{}:{}", record_type, record_id)
    }

    pub async fn store_checksum(&self, record_type: &str, record_id: &str, checksum: &str) -> Result<()> {
        validate_digest(checksum)?;
        let entry = ChecksumEntry {
            record_type: record_type.to_string(),
            record_id: record_id.to_string(),
            checksum: checksum.to_string(),
            timestamp: self.clock.now(),
        };
        self.store
            .put(
                CHECKSUM_TABLE,
                &Self::cache_key(record_type, record_id),
                &serde_json::to_value(&entry)?,
            )
            .await
    }

    pub async fn get_stored_checksum(&self, record_type: &str, record_id: &str) -> Result<Option<String>> {
        let entry: Option<ChecksumEntry> =
            crate::store::load(self.store.as_ref(), CHECKSUM_TABLE, &Self::cache_key(record_type, record_id)).await?;
        Ok(entry.map(|e| e.checksum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SystemClock;
    use crate::hashing::{Sha256Hasher, DIGEST_HEX_LEN};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn setup() -> (ChecksumService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = ChecksumService::new(store.clone(), Arc::new(Sha256Hasher), Arc::new(SystemClock));
        (service, store)
    }

    #[test]
    fn test_key_order_and_checksum_field_ignored() {
        let (service, _) = setup();
        let a = json!({"id": "c-1", "name": "Ana", "address": {"city": "X", "zip": "1"}});
        let b = json!({"address": {"zip": "1", "city": "X"}, "name": "Ana", "id": "c-1", "checksum": "abc"});

        let ha = service.calculate_checksum(&a, &[]).unwrap();
        assert_eq!(ha, service.calculate_checksum(&b, &[]).unwrap());
        assert_eq!(ha.len(), DIGEST_HEX_LEN);

        let c = json!({"id": "c-1", "name": "Ana B", "address": {"city": "X", "zip": "1"}});
        assert_ne!(ha, service.calculate_checksum(&c, &[]).unwrap());
    }

    #[test]
    fn test_mutable_fields_do_not_affect_checksum() {
        let (service, _) = setup();
        let before = json!({"id": "cr-1", "amount": 1000, "balance": 1000, "status": "active"});
        let after = json!({"id": "cr-1", "amount": 1000, "balance": 400, "status": "late", "synced": true});
        assert_eq!(
            service.calculate_credit_checksum(&before).unwrap(),
            service.calculate_credit_checksum(&after).unwrap()
        );

        // Same change on an entity without those declared fields is visible
        assert_ne!(
            service.calculate_payment_checksum(&before).unwrap(),
            service.calculate_payment_checksum(&after).unwrap()
        );
    }

    #[test]
    fn test_non_object_rejected() {
        let (service, _) = setup();
        let err = service.calculate_checksum(&json!([1, 2]), &[]).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_verify_checksum() {
        let (service, _) = setup();
        let mut doc = json!({"id": "c-1", "name": "Ana"});
        let checksum = service.calculate_client_checksum(&doc).unwrap();
        doc["checksum"] = json!(checksum);

        let ok = service.verify_checksum("clients", &doc).unwrap();
        assert!(ok.valid && !ok.corrupted);

        doc["name"] = json!("Eve");
        let bad = service.verify_checksum("clients", &doc).unwrap();
        assert!(bad.corrupted);
        assert_eq!(bad.expected, checksum);
        assert_ne!(bad.actual, checksum);
    }

    #[tokio::test]
    async fn test_integrity_check_repairs_missing_and_reports_corrupted() {
        let (service, store) = setup();

        let mut good = json!({"id": "c-1", "name": "Ana"});
        good["checksum"] = json!(service.calculate_client_checksum(&good).unwrap());
        store.put("clients", "c-1", &good).await.unwrap();

        store.put("clients", "c-2", &json!({"id": "c-2", "name": "Bo"})).await.unwrap();

        let mut tampered = json!({"id": "p-1", "amount": 50});
        tampered["checksum"] = json!(service.calculate_payment_checksum(&tampered).unwrap());
        tampered["amount"] = json!(5000);
        store.put("payments", "p-1", &tampered).await.unwrap();

        let report = service.perform_integrity_check().await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.valid, 1);
        assert_eq!(report.missing, 1);
        assert_eq!(report.repaired, 1);
        assert_eq!(report.corrupted, 1);
        assert_eq!(
            report.errors,
            vec![IntegrityError {
                record_type: "payments".to_string(),
                record_id: "p-1".to_string()
            }]
        );

        // Repair was written back; tampered record was not
        let repaired = store.get("clients", "c-2").await.unwrap().unwrap();
        assert!(service.verify_checksum("clients", &repaired).unwrap().valid);
        assert!(service.get_stored_checksum("clients", "c-2").await.unwrap().is_some());
        let still_bad = store.get("payments", "p-1").await.unwrap().unwrap();
        assert!(service.verify_checksum("payments", &still_bad).unwrap().corrupted);

        let second = service.perform_integrity_check().await.unwrap();
        assert_eq!(second.valid, 2);
        assert_eq!(second.repaired, 0);
    }

    #[tokio::test]
    async fn test_checksum_cache() {
        let (service, _) = setup();
        assert!(service.get_stored_checksum("clients", "c-1").await.unwrap().is_none());

        let digest = "a".repeat(DIGEST_HEX_LEN);
        service.store_checksum("clients", "c-1", &digest).await.unwrap();
        assert_eq!(service.get_stored_checksum("clients", "c-1").await.unwrap(), Some(digest));

        assert!(service.store_checksum("clients", "c-1", "nothex").await.is_err());
    }
}
