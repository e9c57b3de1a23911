//! SQLite document store
//!
//! All tables share one `documents` table keyed by `(tbl, id)`; field lookups
//! go through SQLite's JSON functions.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::KeyValueStore;
use crate::error::Result;

/// Create a new database connection pool and initialize the schema
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    SqliteStore::new(pool.clone()).init().await?;

    Ok(pool)
}

/// Store backed by a SQLite pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the documents table
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                tbl TEXT NOT NULL,
                id TEXT NOT NULL,
                doc TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tbl, id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    doc: String,
}

impl DocumentRow {
    fn decode(self) -> Result<(String, Value)> {
        let doc = serde_json::from_str(&self.doc)?;
        Ok((self.id, doc))
    }
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT doc FROM documents WHERE tbl = ? AND id = ?")
            .bind(table)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(doc,)| serde_json::from_str(&doc).map_err(Into::into))
            .transpose()
    }

    async fn put(&self, table: &str, id: &str, doc: &Value) -> Result<()> {
        let encoded = serde_json::to_string(doc)?;

        sqlx::query(
            r#"
            INSERT INTO documents (tbl, id, doc, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(tbl, id) DO UPDATE SET
                doc = excluded.doc,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(table)
        .bind(id)
        .bind(&encoded)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE tbl = ? AND id = ?")
            .bind(table)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn scan_prefix(&self, table: &str, prefix: &str) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, doc FROM documents
            WHERE tbl = ? AND substr(id, 1, length(?)) = ?
            ORDER BY id ASC
            "#,
        )
        .bind(table)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DocumentRow::decode).collect()
    }

    async fn find_by(&self, table: &str, field: &str, value: &Value) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, doc FROM documents
            WHERE tbl = ? AND json_extract(doc, ?) = json_extract(?, '$')
            ORDER BY id ASC
            "#,
        )
        .bind(table)
        .bind(json_path(field))
        .bind(serde_json::to_string(value)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DocumentRow::decode).collect()
    }
}
