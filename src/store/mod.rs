//! Persistent store abstraction
//!
//! The sync core only needs JSON documents keyed by `(table, id)` with atomic
//! single-document writes, ordered key scans, and top-level field equality
//! lookups. Any backend that offers that satisfies every service here.
//!
//! - [`MemoryStore`]: in-process maps, used by tests and tools
//! - [`SqliteStore`]: one SQLite `documents` table through sqlx

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{create_pool, SqliteStore};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Table holding per-tenant sync bookkeeping (last sync time, device id)
pub const META_TABLE: &str = "sync_meta";

/// Key/value document store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch one document
    async fn get(&self, table: &str, id: &str) -> Result<Option<Value>>;

    /// Insert or replace one document atomically
    async fn put(&self, table: &str, id: &str, doc: &Value) -> Result<()>;

    /// Remove one document, returning whether it existed
    async fn delete(&self, table: &str, id: &str) -> Result<bool>;

    /// Documents whose id starts with `prefix`, ordered by id
    async fn scan_prefix(&self, table: &str, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// Documents whose top-level `field` equals `value`, ordered by id
    async fn find_by(&self, table: &str, field: &str, value: &Value) -> Result<Vec<(String, Value)>>;

    /// Every document in a table, ordered by id
    async fn scan(&self, table: &str) -> Result<Vec<(String, Value)>> {
        self.scan_prefix(table, "").await
    }
}

/// Fetch and decode one document
pub async fn load<T: DeserializeOwned>(store: &dyn KeyValueStore, table: &str, id: &str) -> Result<Option<T>> {
    match store.get(table, id).await? {
        Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
        None => Ok(None),
    }
}

/// Encode and store one document
pub async fn save<T: Serialize>(store: &dyn KeyValueStore, table: &str, id: &str, value: &T) -> Result<()> {
    let doc = serde_json::to_value(value)?;
    store.put(table, id, &doc).await
}

/// Decode a list of scanned documents
pub fn decode_all<T: DeserializeOwned>(rows: Vec<(String, Value)>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|(_, doc)| serde_json::from_value(doc).map_err(Into::into))
        .collect()
}
