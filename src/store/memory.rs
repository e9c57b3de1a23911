//! In-memory document store

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::KeyValueStore;
use crate::error::Result;

type Table = BTreeMap<String, Value>;

/// Store backed by process memory
///
/// Clones share the same underlying tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, Table>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a table
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, table: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.tables.read().get(table).and_then(|t| t.get(id)).cloned())
    }

    async fn put(&self, table: &str, id: &str, doc: &Value) -> Result<()> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone());
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .get_mut(table)
            .map(|t| t.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn scan_prefix(&self, table: &str, prefix: &str) -> Result<Vec<(String, Value)>> {
        let tables = self.tables.read();
        let Some(t) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(t.range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }

    async fn find_by(&self, table: &str, field: &str, value: &Value) -> Result<Vec<(String, Value)>> {
        // Null never matches, same as SQL equality
        if value.is_null() {
            return Ok(Vec::new());
        }
        let tables = self.tables.read();
        let Some(t) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(t.iter()
            .filter(|(_, doc)| doc.get(field) == Some(value))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }
}
