//! Per-device version vectors

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How two version vectors relate causally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    Equal,
    /// Left side has seen everything the right side has, and more
    Dominates,
    /// Right side has seen everything the left side has, and more
    DominatedBy,
    /// Each side has changes the other has not seen
    Concurrent,
}

/// Device id -> logical clock
///
/// Entries only ever grow; an absent device counts as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vector for a record first written by `device_id`
    pub fn initial(device_id: &str) -> Self {
        Self::new().incremented(device_id)
    }

    pub fn get(&self, device_id: &str) -> u64 {
        self.0.get(device_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.0.iter()
    }

    /// New vector with `device_id`'s counter bumped by one
    pub fn incremented(&self, device_id: &str) -> Self {
        let mut next = self.0.clone();
        *next.entry(device_id.to_string()).or_insert(0) += 1;
        Self(next)
    }

    /// Component-wise maximum of both vectors
    pub fn merged(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (device, &count) in &other.0 {
            let entry = merged.entry(device.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
        Self(merged)
    }

    pub fn compare(&self, other: &Self) -> VectorOrdering {
        let mut greater = false;
        let mut less = false;

        for device in self.0.keys().chain(other.0.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Greater => greater = true,
                Ordering::Less => less = true,
                Ordering::Equal => {}
            }
            if greater && less {
                return VectorOrdering::Concurrent;
            }
        }

        match (greater, less) {
            (true, false) => VectorOrdering::Dominates,
            (false, true) => VectorOrdering::DominatedBy,
            _ => VectorOrdering::Equal,
        }
    }

    pub fn dominates(&self, other: &Self) -> bool {
        self.compare(other) == VectorOrdering::Dominates
    }

    /// True iff neither vector dominates the other
    pub fn is_concurrent_with(&self, other: &Self) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VersionVector {
    fn from(entries: [(&str, u64); N]) -> Self {
        Self(entries.iter().map(|(d, c)| (d.to_string(), *c)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_defaults_to_zero() {
        let v = VersionVector::new().incremented("d1");
        assert_eq!(v.get("d1"), 1);

        let v2 = v.incremented("d1").incremented("d2");
        assert_eq!(v2.get("d1"), 2);
        assert_eq!(v2.get("d2"), 1);
        // Original is untouched
        assert_eq!(v.get("d1"), 1);
    }

    #[test]
    fn test_dominance() {
        let a = VersionVector::from([("d1", 2), ("d2", 1)]);
        let b = VersionVector::from([("d1", 1), ("d2", 1)]);

        assert_eq!(a.compare(&b), VectorOrdering::Dominates);
        assert_eq!(b.compare(&a), VectorOrdering::DominatedBy);
        assert!(!a.is_concurrent_with(&b));
    }

    #[test]
    fn test_missing_entries_count_as_zero() {
        let a = VersionVector::from([("d1", 1), ("d2", 1)]);
        let b = VersionVector::from([("d1", 1)]);
        assert_eq!(a.compare(&b), VectorOrdering::Dominates);
    }

    #[test]
    fn test_concurrent() {
        let a = VersionVector::from([("d1", 2), ("d2", 1)]);
        let b = VersionVector::from([("d1", 1), ("d2", 2)]);

        assert_eq!(a.compare(&b), VectorOrdering::Concurrent);
        assert!(a.is_concurrent_with(&b));
        assert!(b.is_concurrent_with(&a));
    }

    #[test]
    fn test_equal_vectors_are_not_ordered() {
        let a = VersionVector::from([("d1", 3)]);
        assert_eq!(a.compare(&a.clone()), VectorOrdering::Equal);
        assert!(a.is_concurrent_with(&a));
    }

    #[test]
    fn test_merged_is_componentwise_max() {
        let a = VersionVector::from([("d1", 2), ("d2", 1)]);
        let b = VersionVector::from([("d1", 1), ("d2", 2), ("d3", 5)]);

        let expected = VersionVector::from([("d1", 2), ("d2", 2), ("d3", 5)]);
        assert_eq!(a.merged(&b), expected);
        assert_eq!(b.merged(&a), expected);
    }
}
