//! Sync module for offline-first multi-device synchronization
//!
//! Provides:
//! - Version vectors and per-field versions on every record
//! - A persistent, prioritized upload queue with exponential backoff
//! - Conflict detection and resolution
//! - Upload / download / verify orchestration against a remote authority
//!
//! # Sync Protocol
//!
//! 1. Local writes land in the store and the queue, never on the network
//! 2. Upload drains the queue as per-table batches, ledger tables first
//! 3. Download fetches remote deltas since the last successful sync
//! 4. A delta that meets an unsynced local record goes through the resolver
//! 5. Verify recomputes record checksums
//!
//! # Conflict Resolution
//!
//! - Append-only (ledger) entities keep the local copy
//! - A dominating version vector wins outright
//! - Concurrent versions merge per field: newest write, then greater device id
//! - Delete wins over update

mod conflict;
mod orchestrator;
mod queue;
pub(crate) mod remote;
mod tracker;
mod types;
mod version;

pub use conflict::{ConflictResolution, ConflictResolver, ConflictStrategy};
pub use orchestrator::{
    load_or_create_device_id, CancellationFlag, OrchestratorConfig, ProgressCallback, SyncOptions,
    SyncOrchestrator, SyncServices, LOCAL_WRITE_ATTEMPTS,
};
pub use queue::{EnqueueOptions, QueueConfig, QueueStats, SyncQueue, SyncQueueItem, QUEUE_TABLE};
pub use remote::{HttpRemoteApi, RemoteApi};
pub use tracker::{ChangeBatch, ChangeTracker, OutboundChange, StagedChange};
pub use types::{
    default_priority, is_append_only, table_class, validate_user_fields, FieldVersion, Operation, RemoteDelta,
    SyncPhase, SyncProgress, SyncReport, SyncStatus, SyncableRecord, TableClass, REMOTE_DEVICE, RESERVED_FIELDS,
};
pub use version::{VectorOrdering, VersionVector};
