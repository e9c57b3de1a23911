//! Fieldsync
//!
//! Offline-first data-consistency core for field-operations apps: many
//! disconnected devices mutate the same records and reconcile later without
//! losing data, while every state change is provably recorded and every
//! stored record can be verified independently of the database engine.
//!
//! # Modules
//!
//! - `sync`: version vectors, conflict resolution, upload queue, orchestration
//! - `audit`: hash-chained, replayable audit log
//! - `integrity`: canonical record checksums and integrity scans
//! - `store`: key-value document store abstraction (in-memory, SQLite)
//! - `routes`: admin HTTP surface used by the binary

pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod hashing;
pub mod integrity;
pub mod payload;
pub mod routes;
pub mod state;
pub mod store;
pub mod sync;

pub use error::{Result, SyncError};
