//! Record content
//!
//! Records carry their user fields as a [`Payload`]: a sorted map from field
//! name to a small closed set of value variants. Unknown fields merge without
//! any schema knowledge, and the sorted map keeps serialization stable.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Result, SyncError};

/// Field name -> value map
pub type Payload = BTreeMap<String, FieldValue>;

/// A single field value
///
/// Serialized untagged, so stored documents read like plain JSON. Timestamps
/// are written as RFC 3339 strings with millisecond precision and come back
/// as [`FieldValue::Text`]; both forms produce identical canonical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    #[serde(serialize_with = "serialize_timestamp", skip_deserializing)]
    Timestamp(DateTime<Utc>),
    List(Vec<FieldValue>),
    Map(Payload),
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(n) => Some(*n as f64),
            FieldValue::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Convert to a `serde_json::Value` for hashing or transport
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(value as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

impl From<Payload> for FieldValue {
    fn from(value: Payload) -> Self {
        FieldValue::Map(value)
    }
}

/// Build a payload from a JSON object
pub fn from_json(value: serde_json::Value) -> Result<Payload> {
    if !value.is_object() {
        return Err(SyncError::Validation(format!(
            "payload must be a JSON object, got {}",
            value
        )));
    }
    Ok(serde_json::from_value(value)?)
}

/// Payload as a JSON object
pub fn to_json(payload: &Payload) -> serde_json::Value {
    serde_json::to_value(payload).unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
}

/// Overlay `update` onto `base`, field by field (no deep merge)
pub fn merge_shallow(base: &Payload, update: &Payload) -> Payload {
    let mut merged = base.clone();
    for (key, value) in update {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
