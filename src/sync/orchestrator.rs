//! Sync orchestration
//!
//! One `sync()` run uploads queued local changes, downloads remote deltas
//! (resolving conflicts against unsynced local records), then verifies
//! integrity. Runs are single-flight per orchestrator; failures are
//! collected into the report instead of aborting the run.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::conflict::{ConflictResolution, ConflictResolver, ConflictStrategy};
use super::queue::{EnqueueOptions, SyncQueue};
use super::remote::RemoteApi;
use super::tracker::{ChangeBatch, ChangeTracker};
use super::types::{Operation, RemoteDelta, SyncPhase, SyncProgress, SyncReport, SyncStatus, SyncableRecord};
use crate::audit::{AuditLog, EventType, NewAuditEvent};
use crate::context::{Clock, SessionContext};
use crate::error::{Result, SyncError};
use crate::integrity::ChecksumService;
use crate::payload::{merge_shallow, FieldValue, Payload};
use crate::store::{self, KeyValueStore, META_TABLE};

/// Attempts for a local write before its error surfaces
pub const LOCAL_WRITE_ATTEMPTS: u32 = 3;

const LOCAL_RETRY_DELAY: Duration = Duration::from_millis(50);

const DEVICE_ID_KEY: &str = "device_id";

#[derive(Debug, Serialize, Deserialize)]
struct MetaValue<T> {
    value: T,
}

/// Stable id of this installation, generated on first use
pub async fn load_or_create_device_id(store: &dyn KeyValueStore) -> Result<String> {
    if let Some(meta) = store::load::<MetaValue<String>>(store, META_TABLE, DEVICE_ID_KEY).await? {
        return Ok(meta.value);
    }

    let device_id = Uuid::new_v4().to_string();
    store::save(
        store,
        META_TABLE,
        DEVICE_ID_KEY,
        &MetaValue {
            value: device_id.clone(),
        },
    )
    .await?;
    tracing::info!(device_id = %device_id, "Generated device id");
    Ok(device_id)
}

/// Retry a local write a bounded number of times
async fn with_local_retries<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < LOCAL_WRITE_ATTEMPTS && !matches!(e, SyncError::Validation(_)) => {
                tracing::warn!(operation = %what, attempt = attempt, error = %e, "Local write failed, retrying");
                tokio::time::sleep(LOCAL_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(SyncProgress) + Send + Sync>;

/// Cooperative cancellation signal, polled between units of work
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct SyncOptions {
    /// Run even if another sync is in progress
    pub force: bool,
    pub progress: Option<ProgressCallback>,
    pub cancel: Option<CancellationFlag>,
}

impl SyncOptions {
    fn report(&self, phase: SyncPhase, current: usize, total: usize, message: impl Into<String>) {
        if let Some(progress) = &self.progress {
            progress(SyncProgress {
                phase,
                current,
                total,
                message: message.into(),
            });
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancellationFlag::is_cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Applies to each remote call
    pub remote_timeout: Duration,
    pub verify_after_sync: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(30),
            verify_after_sync: true,
        }
    }
}

/// Decrements the active-run counter when a run ends
struct ActiveRun<'a>(&'a AtomicUsize);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Collaborators the orchestrator drives
pub struct SyncServices {
    pub store: Arc<dyn KeyValueStore>,
    pub queue: SyncQueue,
    pub audit: AuditLog,
    pub checksums: ChecksumService,
    pub remote: Arc<dyn RemoteApi>,
    pub clock: Arc<dyn Clock>,
}

pub struct SyncOrchestrator {
    store: Arc<dyn KeyValueStore>,
    tracker: ChangeTracker,
    queue: SyncQueue,
    resolver: ConflictResolver,
    audit: AuditLog,
    checksums: ChecksumService,
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    context: SessionContext,
    config: OrchestratorConfig,
    active: AtomicUsize,
    online: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        services: SyncServices,
        resolver: ConflictResolver,
        context: SessionContext,
        config: OrchestratorConfig,
    ) -> Self {
        let tracker = ChangeTracker::new(
            services.store.clone(),
            services.queue.clone(),
            services.clock.clone(),
            context.clone(),
        );

        Self {
            store: services.store,
            tracker,
            queue: services.queue,
            resolver,
            audit: services.audit,
            checksums: services.checksums,
            remote: services.remote,
            clock: services.clock,
            context,
            config,
            active: AtomicUsize::new(0),
            online: AtomicBool::new(true),
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn checksums(&self) -> &ChecksumService {
        &self.checksums
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn is_syncing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            tracing::info!(online = online, "Connectivity changed");
        }
    }

    fn last_sync_key(&self) -> String {
        format!("last_sync:{}", self.context.tenant_id)
    }

    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let meta: Option<MetaValue<DateTime<Utc>>> =
            store::load(self.store.as_ref(), META_TABLE, &self.last_sync_key()).await?;
        Ok(meta.map(|m| m.value))
    }

    async fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        store::save(self.store.as_ref(), META_TABLE, &self.last_sync_key(), &MetaValue { value: at }).await
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            is_syncing: self.is_syncing(),
            online: self.is_online(),
            last_sync: self.last_sync().await?,
            queue: self.queue.get_stats().await?,
        })
    }

    /// Apply a local mutation: store, queue, audit, checksum cache
    ///
    /// Never touches the network, so it succeeds offline.
    pub async fn record_local_change(
        &self,
        table: &str,
        record_id: &str,
        operation: Operation,
        fields: Payload,
    ) -> Result<SyncableRecord> {
        let mut staged = self.tracker.stage_change(table, record_id, operation, fields).await?;
        let checksum = self.checksums.calculate_record_checksum(table, &staged.record)?;
        staged.record.checksum = checksum.clone();

        let tracker = &self.tracker;
        let audit = &self.audit;
        let checksums = &self.checksums;
        let staged_ref = &staged;

        with_local_retries("persist record", || tracker.persist(staged_ref)).await?;
        if let Err(e) = with_local_retries("enqueue change", || tracker.enqueue(staged_ref)).await {
            // A stored change with no queue item would never upload
            if let Err(revert_err) = tracker.revert(staged_ref).await {
                tracing::error!(
                    table = %table,
                    record_id = %record_id,
                    error = %revert_err,
                    "Failed to revert unqueued local change"
                );
            }
            return Err(e);
        }

        let event_type = match staged.operation {
            Operation::Insert => EventType::Create,
            Operation::Update => EventType::Update,
            Operation::Delete => EventType::Delete,
        };
        with_local_retries("audit change", || {
            audit.log_event(NewAuditEvent::new(event_type, table, record_id, staged_ref.delta.clone()))
        })
        .await?;
        with_local_retries("cache checksum", || checksums.store_checksum(table, record_id, &checksum)).await?;

        tracing::debug!(
            table = %table,
            record_id = %record_id,
            operation = ?staged.operation,
            "Recorded local change"
        );
        Ok(staged.record)
    }

    /// Run one upload / download / verify cycle
    pub async fn sync(&self, options: SyncOptions) -> SyncReport {
        let started = self.clock.now();

        if options.force {
            self.active.fetch_add(1, Ordering::SeqCst);
        } else if self
            .active
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Sync already in progress, request rejected");
            return SyncReport::rejected(started, "Sync already in progress");
        }
        let _run = ActiveRun(&self.active);

        if !self.is_online() {
            return SyncReport::rejected(started, "Offline: sync skipped");
        }

        tracing::info!(tenant = %self.context.tenant_id, force = options.force, "Sync started");
        let mut report = SyncReport::empty(started);

        self.upload_phase(&options, &mut report).await;

        let mut download_complete = false;
        if !options.is_cancelled() {
            download_complete = self.download_phase(&options, &mut report).await;
        }

        if !options.is_cancelled() && self.config.verify_after_sync {
            self.verify_phase(&options, &mut report).await;
        }

        report.cancelled = options.is_cancelled();
        if report.cancelled {
            report.message = Some("Sync cancelled".to_string());
        } else {
            if download_complete {
                if let Err(e) = self.set_last_sync(started).await {
                    report.errors.push(format!("persist last sync: {}", e));
                }
            }
            if let Err(e) = self.queue.clear_synced().await {
                report.errors.push(format!("clear synced queue items: {}", e));
            }
        }

        report.success = report.errors.is_empty() && !report.cancelled;
        self.log_sync_event(&report).await;
        options.report(SyncPhase::Complete, 1, 1, "Sync finished");

        tracing::info!(
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            conflicts = report.conflicts,
            errors = report.errors.len(),
            cancelled = report.cancelled,
            "Sync finished"
        );
        report
    }

    async fn upload_phase(&self, options: &SyncOptions, report: &mut SyncReport) {
        let batches = match self.tracker.pending_batches(None).await {
            Ok(batches) => batches,
            Err(e) => {
                report.errors.push(format!("load pending changes: {}", e));
                return;
            }
        };

        let total = batches.len();
        options.report(SyncPhase::Upload, 0, total, format!("Uploading {} batches", total));

        for (idx, batch) in batches.iter().enumerate() {
            if options.is_cancelled() {
                tracing::info!(remaining = total - idx, "Upload cancelled");
                break;
            }

            match self.push_batch(batch).await {
                Ok(()) => match self.tracker.mark_batch_synced(batch).await {
                    Ok(()) => {
                        report.uploaded += batch.changes.len();
                        tracing::info!(table = %batch.table, changes = batch.changes.len(), "Batch uploaded");
                    }
                    Err(e) => report.errors.push(format!("{}: mark synced: {}", batch.table, e)),
                },
                Err(e) => {
                    tracing::warn!(table = %batch.table, error = %e, transient = e.is_transient(), "Batch push failed");
                    report.errors.push(format!("{}: {}", batch.table, e));
                    if let Err(mark_err) = self.tracker.mark_batch_failed(batch, &e.to_string()).await {
                        report.errors.push(format!("{}: re-enqueue: {}", batch.table, mark_err));
                    }
                }
            }

            options.report(SyncPhase::Upload, idx + 1, total, format!("Uploaded {}", batch.table));
        }
    }

    async fn push_batch(&self, batch: &ChangeBatch) -> Result<()> {
        let timeout = self.config.remote_timeout;
        tokio::time::timeout(timeout, self.remote.push_batch(&batch.table, &batch.changes))
            .await
            .map_err(|_| SyncError::Timeout(timeout.as_secs()))?
    }

    /// Returns true when every delta was fetched and applied
    async fn download_phase(&self, options: &SyncOptions, report: &mut SyncReport) -> bool {
        let since = match self.last_sync().await {
            Ok(since) => since,
            Err(e) => {
                report.errors.push(format!("load last sync: {}", e));
                return false;
            }
        };

        let timeout = self.config.remote_timeout;
        let fetched = tokio::time::timeout(timeout, self.remote.fetch_changes_since(since))
            .await
            .map_err(|_| SyncError::Timeout(timeout.as_secs()))
            .and_then(|r| r);
        let deltas = match fetched {
            Ok(deltas) => deltas,
            Err(e) => {
                tracing::warn!(error = %e, "Fetching remote changes failed");
                report.errors.push(format!("fetch changes: {}", e));
                return false;
            }
        };

        let total = deltas.len();
        options.report(SyncPhase::Download, 0, total, format!("Applying {} changes", total));

        let mut complete = true;
        for (idx, delta) in deltas.iter().enumerate() {
            if options.is_cancelled() {
                tracing::info!(remaining = total - idx, "Download cancelled");
                return false;
            }

            match self.apply_delta(delta).await {
                Ok(DeltaOutcome::Applied) => report.downloaded += 1,
                Ok(DeltaOutcome::Conflict) => {
                    report.downloaded += 1;
                    report.conflicts += 1;
                }
                Ok(DeltaOutcome::Skipped) => {}
                Err(e) => {
                    complete = false;
                    tracing::warn!(
                        table = %delta.table,
                        record_id = %delta.record_id,
                        error = %e,
                        "Skipping remote change"
                    );
                    report.errors.push(format!("{}/{}: {}", delta.table, delta.record_id, e));
                }
            }

            options.report(SyncPhase::Download, idx + 1, total, format!("Applied {}", delta.record_id));
        }

        complete
    }

    async fn apply_delta(&self, delta: &RemoteDelta) -> Result<DeltaOutcome> {
        delta.validate()?;

        let now = self.clock.now();
        let remote = delta.to_record(&self.context.tenant_id, now);

        match self.tracker.load_record(&delta.table, &delta.record_id).await? {
            Some(local) if !local.synced => {
                let remote = overlay_delta(&local, remote);
                let resolution = self.resolver.resolve_conflict(&local, &remote, &delta.table)?;
                self.apply_resolution(&delta.table, resolution).await?;
                Ok(DeltaOutcome::Conflict)
            }
            Some(local) if local.version_vector.dominates(&delta.vector) || local.version_vector == delta.vector => {
                tracing::debug!(
                    table = %delta.table,
                    record_id = %delta.record_id,
                    "Remote change already applied, skipping"
                );
                Ok(DeltaOutcome::Skipped)
            }
            Some(local) => {
                let mut record = overlay_delta(&local, remote);
                record.version_vector = local.version_vector.merged(&delta.vector);
                self.write_synced(&delta.table, record).await?;
                Ok(DeltaOutcome::Applied)
            }
            None => {
                self.write_synced(&delta.table, remote).await?;
                Ok(DeltaOutcome::Applied)
            }
        }
    }

    /// Persist a record that matches the authority's copy
    async fn write_synced(&self, table: &str, mut record: SyncableRecord) -> Result<()> {
        record.synced = true;
        record.checksum = self.checksums.calculate_record_checksum(table, &record)?;
        self.tracker.save_record(table, &record).await?;
        self.checksums.store_checksum(table, &record.id, &record.checksum).await
    }

    async fn apply_resolution(&self, table: &str, resolution: ConflictResolution) -> Result<()> {
        let ConflictResolution {
            strategy,
            resolved: mut record,
            conflicts_detected,
        } = resolution;

        match strategy {
            ConflictStrategy::RemoteWins => {
                // The authority's version already includes the queued local edits
                self.queue.mark_record_synced(table, &record.id).await?;
                self.write_synced(table, record.clone()).await?;
            }
            ConflictStrategy::Merged | ConflictStrategy::LocalWins => {
                if strategy == ConflictStrategy::Merged {
                    record.version_vector = record.version_vector.incremented(&self.context.device_id);
                    record.updated_at = self.clock.now();
                }
                record.synced = false;
                record.checksum = self.checksums.calculate_record_checksum(table, &record)?;
                self.tracker.save_record(table, &record).await?;
                self.checksums.store_checksum(table, &record.id, &record.checksum).await?;
                self.queue
                    .add_to_queue(
                        table,
                        &record.id,
                        Operation::Update,
                        EnqueueOptions {
                            priority: None,
                            data: Some(record.fields.clone()),
                        },
                    )
                    .await?;
            }
            ConflictStrategy::AppendOnly => {}
        }

        tracing::info!(
            table = %table,
            record_id = %record.id,
            strategy = ?strategy,
            fields = ?conflicts_detected,
            "Conflict resolved"
        );

        let strategy_name = serde_json::to_value(strategy)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let data = Payload::from([
            ("strategy".to_string(), FieldValue::from(strategy_name)),
            (
                "fields".to_string(),
                FieldValue::List(conflicts_detected.iter().map(|f| FieldValue::from(f.as_str())).collect()),
            ),
        ]);
        self.audit
            .log_event(NewAuditEvent::new(EventType::ConflictResolved, table, &record.id, data))
            .await?;
        Ok(())
    }

    async fn verify_phase(&self, options: &SyncOptions, report: &mut SyncReport) {
        options.report(SyncPhase::Verify, 0, 1, "Verifying integrity");

        match self.checksums.perform_integrity_check().await {
            Ok(integrity) => {
                for bad in &integrity.errors {
                    report
                        .errors
                        .push(format!("integrity: {}/{} checksum mismatch", bad.record_type, bad.record_id));
                }
                if integrity.repaired > 0 {
                    let data = Payload::from([
                        ("repaired".to_string(), FieldValue::Integer(integrity.repaired as i64)),
                        ("total".to_string(), FieldValue::Integer(integrity.total as i64)),
                    ]);
                    let event = NewAuditEvent::new(EventType::IntegrityRepair, "integrity", &self.context.tenant_id, data);
                    if let Err(e) = self.audit.log_event(event).await {
                        report.errors.push(format!("audit integrity repair: {}", e));
                    }
                }
            }
            Err(e) => report.errors.push(format!("integrity check: {}", e)),
        }

        options.report(SyncPhase::Verify, 1, 1, "Integrity verified");
    }

    async fn log_sync_event(&self, report: &SyncReport) {
        let data = Payload::from([
            ("uploaded".to_string(), FieldValue::Integer(report.uploaded as i64)),
            ("downloaded".to_string(), FieldValue::Integer(report.downloaded as i64)),
            ("conflicts".to_string(), FieldValue::Integer(report.conflicts as i64)),
            ("errors".to_string(), FieldValue::Integer(report.errors.len() as i64)),
            ("success".to_string(), FieldValue::Bool(report.success)),
        ]);
        let event = NewAuditEvent::new(EventType::Sync, "sync", &self.context.tenant_id, data);
        if let Err(e) = self.audit.log_event(event).await {
            tracing::error!(error = %e, "Failed to audit sync run");
        }
    }
}

/// A partial remote delta laid over the full local record
fn overlay_delta(local: &SyncableRecord, mut remote: SyncableRecord) -> SyncableRecord {
    remote.fields = merge_shallow(&local.fields, &remote.fields);
    let mut field_versions = local.field_versions.clone();
    field_versions.append(&mut remote.field_versions);
    remote.field_versions = field_versions;
    remote.created_at = local.created_at;
    remote
}

enum DeltaOutcome {
    Applied,
    Conflict,
    Skipped,
}
