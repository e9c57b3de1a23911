//! Conflict detection and resolution
//!
//! Two versions of the same record are ordered by their version vectors.
//! When one dominates, it wins outright; when they are concurrent, the
//! record is merged field by field using each field's last-writer metadata.
//! Ledger-like entity types are append-only and never merged.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{is_append_only, FieldVersion, SyncableRecord};
use super::version::{VectorOrdering, VersionVector};
use crate::error::{Result, SyncError};
use crate::hashing::to_canonical_bytes;
use crate::payload::FieldValue;

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Append-only entity: the local copy is canonical
    AppendOnly,
    LocalWins,
    RemoteWins,
    /// Concurrent versions merged field by field
    Merged,
}

/// Result of conflict resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    pub resolved: SyncableRecord,
    /// User fields whose values differed between the two sides
    pub conflicts_detected: Vec<String>,
}

/// Conflict resolver with per-entity append-only configuration
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    append_only: Option<BTreeSet<String>>,
}

impl ConflictResolver {
    /// Resolver using the built-in ledger table classes
    pub fn new() -> Self {
        Self { append_only: None }
    }

    /// Resolver with an explicit set of append-only entity types
    pub fn with_append_only<I, S>(entity_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            append_only: Some(entity_types.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_append_only(&self, entity_type: &str) -> bool {
        match &self.append_only {
            Some(set) => set.contains(entity_type),
            None => is_append_only(entity_type),
        }
    }

    /// Settle two versions of one record
    ///
    /// Divergent data is the normal input here; only unversioned or
    /// mismatched records are rejected.
    pub fn resolve_conflict(
        &self,
        local: &SyncableRecord,
        remote: &SyncableRecord,
        entity_type: &str,
    ) -> Result<ConflictResolution> {
        validate_pair(local, remote)?;
        let conflicts_detected = differing_fields(local, remote);

        if self.is_append_only(entity_type) {
            // TODO: compare content before preferring local, so duplicate
            // submissions of the same payment from two devices are caught.
            if !conflicts_detected.is_empty() {
                tracing::warn!(
                    entity_type = %entity_type,
                    record_id = %local.id,
                    fields = ?conflicts_detected,
                    "Append-only record differs from remote copy, keeping local"
                );
            }
            return Ok(ConflictResolution {
                strategy: ConflictStrategy::AppendOnly,
                resolved: local.clone(),
                conflicts_detected,
            });
        }

        let (strategy, resolved) = match local.version_vector.compare(&remote.version_vector) {
            VectorOrdering::Dominates => (ConflictStrategy::LocalWins, local.clone()),
            VectorOrdering::DominatedBy => (ConflictStrategy::RemoteWins, remote.clone()),
            VectorOrdering::Concurrent | VectorOrdering::Equal => {
                (ConflictStrategy::Merged, merge_records(local, remote))
            }
        };

        tracing::debug!(
            entity_type = %entity_type,
            record_id = %local.id,
            strategy = ?strategy,
            conflicting_fields = conflicts_detected.len(),
            "Resolved conflict"
        );

        Ok(ConflictResolution {
            strategy,
            resolved,
            conflicts_detected,
        })
    }

    /// New vector with `device_id`'s entry bumped by one
    pub fn increment_version(vector: &VersionVector, device_id: &str) -> VersionVector {
        vector.incremented(device_id)
    }

    /// One `field_versions` entry
    pub fn create_field_version(value: FieldValue, device_id: &str, timestamp: Option<DateTime<Utc>>) -> FieldVersion {
        FieldVersion::new(value, device_id, timestamp.unwrap_or_else(Utc::now))
    }

    /// True iff neither vector dominates the other
    pub fn are_concurrent(a: &VersionVector, b: &VersionVector) -> bool {
        a.is_concurrent_with(b)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_pair(local: &SyncableRecord, remote: &SyncableRecord) -> Result<()> {
    if local.id != remote.id {
        return Err(SyncError::Validation(format!(
            "cannot resolve different records '{}' and '{}'",
            local.id, remote.id
        )));
    }
    for (side, record) in [("local", local), ("remote", remote)] {
        if record.version_vector.is_empty() {
            return Err(SyncError::Validation(format!(
                "{} record '{}' has no version vector",
                side, record.id
            )));
        }
    }
    Ok(())
}

fn differing_fields(local: &SyncableRecord, remote: &SyncableRecord) -> Vec<String> {
    let names: BTreeSet<&String> = local.fields.keys().chain(remote.fields.keys()).collect();
    names
        .into_iter()
        .filter(|name| local.fields.get(*name) != remote.fields.get(*name))
        .cloned()
        .collect()
}

/// Total order over values, used only to break exact ties deterministically
fn value_order(a: &FieldValue, b: &FieldValue) -> Ordering {
    let bytes = |v: &FieldValue| to_canonical_bytes(&v.to_json()).unwrap_or_default();
    bytes(a).cmp(&bytes(b))
}

/// Later timestamp wins; equal timestamps go to the greater device id
fn newer_field<'a>(a: &'a FieldVersion, b: &'a FieldVersion) -> &'a FieldVersion {
    let ordering = a
        .timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.device_id.cmp(&b.device_id))
        .then_with(|| value_order(&a.value, &b.value));
    if ordering == Ordering::Less {
        b
    } else {
        a
    }
}

fn merge_records(local: &SyncableRecord, remote: &SyncableRecord) -> SyncableRecord {
    let mut field_versions = BTreeMap::new();
    let mut fields = BTreeMap::new();

    let names: BTreeSet<&String> = local
        .field_versions
        .keys()
        .chain(remote.field_versions.keys())
        .chain(local.fields.keys())
        .chain(remote.fields.keys())
        .collect();

    for name in names {
        let winner = match (local.field_versions.get(name), remote.field_versions.get(name)) {
            (Some(l), Some(r)) => Some(newer_field(l, r)),
            (Some(l), None) => Some(l),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        };

        match winner {
            Some(version) => {
                fields.insert(name.clone(), version.value.clone());
                field_versions.insert(name.clone(), version.clone());
            }
            None => {
                // Unversioned on both sides: the later record write wins
                let value = match (local.fields.get(name), remote.fields.get(name)) {
                    (Some(l), Some(r)) => {
                        let ordering = local
                            .updated_at
                            .cmp(&remote.updated_at)
                            .then_with(|| value_order(l, r));
                        if ordering == Ordering::Less {
                            r
                        } else {
                            l
                        }
                    }
                    (Some(v), None) | (None, Some(v)) => v,
                    (None, None) => continue,
                };
                fields.insert(name.clone(), value.clone());
            }
        }
    }

    SyncableRecord {
        id: local.id.clone(),
        tenant_id: local.tenant_id.clone(),
        version_vector: local.version_vector.merged(&remote.version_vector),
        field_versions,
        checksum: String::new(),
        synced: false,
        // Delete wins over update
        deleted: local.deleted || remote.deleted,
        created_at: local.created_at.min(remote.created_at),
        updated_at: local.updated_at.max(remote.updated_at),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn make_record(vector: VersionVector, versions: &[(&str, &str, &str, i64)]) -> SyncableRecord {
        let mut fields = Payload::new();
        let mut field_versions = BTreeMap::new();
        for (name, value, device, offset) in versions {
            let version = FieldVersion::new(FieldValue::from(*value), device, t0() + Duration::seconds(*offset));
            fields.insert(name.to_string(), version.value.clone());
            field_versions.insert(name.to_string(), version);
        }
        SyncableRecord {
            id: "client-1".to_string(),
            tenant_id: "t1".to_string(),
            version_vector: vector,
            field_versions,
            checksum: String::new(),
            synced: false,
            deleted: false,
            created_at: t0(),
            updated_at: t0(),
            fields,
        }
    }

    #[test]
    fn test_local_dominates() {
        let resolver = ConflictResolver::new();
        let local = make_record(VersionVector::from([("d1", 2), ("d2", 1)]), &[("nombre", "local", "d1", 5)]);
        let remote = make_record(VersionVector::from([("d1", 1), ("d2", 1)]), &[("nombre", "remote", "d2", 9)]);

        let result = resolver.resolve_conflict(&local, &remote, "clients").unwrap();
        assert_eq!(result.strategy, ConflictStrategy::LocalWins);
        assert_eq!(result.resolved, local);
        assert_eq!(result.conflicts_detected, vec!["nombre".to_string()]);
    }

    #[test]
    fn test_remote_dominates() {
        let resolver = ConflictResolver::new();
        let local = make_record(VersionVector::from([("d1", 1), ("d2", 1)]), &[("nombre", "local", "d1", 5)]);
        let remote = make_record(VersionVector::from([("d1", 2), ("d2", 1)]), &[("nombre", "remote", "d1", 1)]);

        let result = resolver.resolve_conflict(&local, &remote, "clients").unwrap();
        assert_eq!(result.strategy, ConflictStrategy::RemoteWins);
        assert_eq!(result.resolved.fields["nombre"], FieldValue::from("remote"));
    }

    #[test]
    fn test_concurrent_merge_picks_newest_field() {
        let resolver = ConflictResolver::new();
        let local = make_record(
            VersionVector::from([("d1", 2), ("d2", 1)]),
            &[("nombre", "Ana L", "d1", 10), ("telefono", "111", "d1", 1)],
        );
        let remote = make_record(
            VersionVector::from([("d1", 1), ("d2", 2)]),
            &[("nombre", "Ana R", "d2", 5), ("telefono", "222", "d2", 20), ("email", "a@x", "d2", 3)],
        );

        let result = resolver.resolve_conflict(&local, &remote, "clients").unwrap();
        assert_eq!(result.strategy, ConflictStrategy::Merged);

        let merged = &result.resolved;
        assert_eq!(merged.fields["nombre"], FieldValue::from("Ana L"));
        assert_eq!(merged.fields["telefono"], FieldValue::from("222"));
        assert_eq!(merged.fields["email"], FieldValue::from("a@x"));
        assert_eq!(merged.field_versions["telefono"].device_id, "d2");
        assert_eq!(merged.version_vector, VersionVector::from([("d1", 2), ("d2", 2)]));
        assert!(!merged.synced);
    }

    #[test]
    fn test_merge_tie_break_is_commutative() {
        let resolver = ConflictResolver::new();
        let a = make_record(VersionVector::from([("d1", 2), ("d2", 1)]), &[("nombre", "from d1", "d1", 7)]);
        let b = make_record(VersionVector::from([("d1", 1), ("d2", 2)]), &[("nombre", "from d2", "d2", 7)]);

        let ab = resolver.resolve_conflict(&a, &b, "clients").unwrap().resolved;
        let ba = resolver.resolve_conflict(&b, &a, "clients").unwrap().resolved;

        // Same timestamp: the lexicographically greater device wins on both replicas
        assert_eq!(ab.fields["nombre"], FieldValue::from("from d2"));
        assert_eq!(ab.fields, ba.fields);
        assert_eq!(ab.field_versions, ba.field_versions);
        assert_eq!(ab.version_vector, ba.version_vector);
    }

    #[test]
    fn test_merge_propagates_tombstone() {
        let resolver = ConflictResolver::new();
        let local = make_record(VersionVector::from([("d1", 2)]), &[("nombre", "A", "d1", 1)]);
        let mut remote = make_record(VersionVector::from([("d2", 1)]), &[("nombre", "A", "d2", 1)]);
        remote.deleted = true;

        let result = resolver.resolve_conflict(&local, &remote, "clients").unwrap();
        assert_eq!(result.strategy, ConflictStrategy::Merged);
        assert!(result.resolved.deleted);
    }

    #[test]
    fn test_append_only_keeps_local() {
        let resolver = ConflictResolver::new();
        let local = make_record(VersionVector::from([("d1", 1)]), &[("monto", "100", "d1", 1)]);
        let remote = make_record(VersionVector::from([("d1", 1), ("d2", 3)]), &[("monto", "150", "d2", 9)]);

        let result = resolver.resolve_conflict(&local, &remote, "payments").unwrap();
        assert_eq!(result.strategy, ConflictStrategy::AppendOnly);
        assert_eq!(result.resolved, local);
    }

    #[test]
    fn test_configured_append_only_types() {
        let resolver = ConflictResolver::with_append_only(["visits"]);
        assert!(resolver.is_append_only("visits"));
        assert!(!resolver.is_append_only("payments"));
    }

    #[test]
    fn test_unversioned_record_is_rejected() {
        let resolver = ConflictResolver::new();
        let local = make_record(VersionVector::new(), &[]);
        let remote = make_record(VersionVector::from([("d1", 1)]), &[]);

        let err = resolver.resolve_conflict(&local, &remote, "clients").unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_helpers() {
        let v = ConflictResolver::increment_version(&VersionVector::new(), "d9");
        assert_eq!(v.get("d9"), 1);

        let fv = ConflictResolver::create_field_version(FieldValue::from(3), "d9", Some(t0()));
        assert_eq!(fv.timestamp, t0());
        assert_eq!(fv.device_id, "d9");

        let a = VersionVector::from([("d1", 2), ("d2", 1)]);
        let b = VersionVector::from([("d1", 1), ("d2", 2)]);
        assert!(ConflictResolver::are_concurrent(&a, &b));
    }
}
