//! # Sync Orchestrator
//!
//! Drives upload, download and verification passes against a [`RemoteStore`].
//!
//! ## Workflow
//!
//! 1. **Gate**: offline, another pass running (unless `force`) or an open
//!    circuit breaker (unless `bypass_circuit`) reject the pass up front
//! 2. **Upload**: compress pending changes into per-record deltas, push them
//!    chunk by chunk, settle each record's queue items
//! 3. **Download**: fetch remote changes since the last successful pass and
//!    merge them into the local store through the conflict resolver
//! 4. **Verify**: probe the local store; damage triggers a rebuild from remote
//! 5. **Finish**: persist the pass start as `last_sync_timestamp`, feed the
//!    circuit breaker, sweep old synced change-log entries, emit events
//!
//! A chunk that fails to upload is recorded on its queue items and the pass
//! carries on. Failures while downloading or verifying fail the pass.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let orchestrator = SyncOrchestrator::builder(config, pool)
//!     .remote(remote)
//!     .network(network_monitor)
//!     .settings(settings_store)
//!     .build()
//!     .await?;
//!
//! orchestrator.record_local_change(&Record::Pago(pago)).await?;
//!
//! let result = orchestrator.sync(SyncOptions::default()).await;
//! if !result.success {
//!     warn!(errors = ?result.errors, "Sync did not complete");
//! }
//! ```

use crate::change_tracker::{ChangeTracker, DeltaBatch, Operation};
use crate::circuit_breaker::{CircuitBreaker, CircuitState, CircuitTransition};
use crate::conflict_resolver::ConflictResolver;
use crate::error::{Result, SyncError};
use crate::error_log::SyncErrorEntry;
use crate::pass::{SyncPass, SyncPhase, SyncProgress, SyncResult};
use crate::remote::{RemoteChange, RemoteResult, RemoteStore};
use crate::sync_queue::{QueueOptions, RetryPolicy, SyncQueue, SyncQueueItem};
use bridge_traits::network::NetworkMonitor;
use bridge_traits::storage::SettingsStore;
use bridge_traits::time::{Clock, MonotonicClock, SystemClock, SystemMonotonicClock};
use core_async::sync::CancellationToken;
use core_async::time::timeout;
use core_runtime::config::SyncEngineConfig;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use core_store::{
    CrdtRecord, FieldMap, IntegrityProbe, Record, RecordRepository, SqliteRecordRepository,
    StoreError, TableKind,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, warn};

/// Settings key holding the start time of the last successful pass
pub const LAST_SYNC_KEY: &str = "last_sync_timestamp";

/// Callback receiving progress reports
pub type ProgressCallback = Arc<dyn Fn(SyncProgress) + Send + Sync>;

/// Options for [`SyncOrchestrator::sync`]
#[derive(Clone)]
pub struct SyncOptions {
    /// Bypass the single-pass guard
    pub force: bool,
    /// Run even while the circuit breaker is open
    pub bypass_circuit: bool,
    /// What asked for the pass, reported in events
    pub trigger: String,
    pub on_progress: Option<ProgressCallback>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force: false,
            bypass_circuit: false,
            trigger: "manual".to_string(),
            on_progress: None,
        }
    }
}

impl SyncOptions {
    /// Bypasses both the single-pass guard and the circuit breaker.
    pub fn forced() -> Self {
        Self {
            force: true,
            bypass_circuit: true,
            ..Self::default()
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = trigger.into();
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("force", &self.force)
            .field("bypass_circuit", &self.bypass_circuit)
            .field("trigger", &self.trigger)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub online: bool,
    pub connection_type: Option<String>,
    pub effective_type: Option<String>,
}

impl ConnectionStatus {
    fn offline() -> Self {
        Self {
            online: false,
            connection_type: None,
            effective_type: None,
        }
    }
}

/// Outcome of [`SyncOrchestrator::run_maintenance`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub changes_cleared: u64,
}

// ============================================================================
// Engine State
// ============================================================================

/// Mutable engine state shared by every pass
pub struct SyncEngineState {
    active_passes: AtomicUsize,
    last_sync: Mutex<Option<i64>>,
    phase: Mutex<SyncPhase>,
    cancellation: Mutex<CancellationToken>,
}

impl SyncEngineState {
    pub fn new(last_sync: Option<i64>) -> Self {
        Self {
            active_passes: AtomicUsize::new(0),
            last_sync: Mutex::new(last_sync),
            phase: Mutex::new(SyncPhase::Idle),
            cancellation: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.active_passes.load(Ordering::SeqCst) > 0
    }

    /// Phase of the most recently advanced pass
    pub fn current_phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_sync_timestamp(&self) -> Option<i64> {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    fn set_last_sync(&self, timestamp: i64) {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(timestamp);
    }

    fn begin(&self, force: bool) -> Option<PassGuard<'_>> {
        if force {
            self.active_passes.fetch_add(1, Ordering::SeqCst);
        } else if self
            .active_passes
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        Some(PassGuard { state: self })
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.cancellation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel running passes; later passes get a fresh token.
    fn cancel(&self) -> bool {
        let mut token = self.cancellation.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_syncing() {
            return false;
        }
        token.cancel();
        *token = CancellationToken::new();
        true
    }
}

struct PassGuard<'a> {
    state: &'a SyncEngineState,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.state.active_passes.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct SyncOrchestratorBuilder {
    config: SyncEngineConfig,
    pool: SqlitePool,
    remote: Option<Arc<dyn RemoteStore>>,
    network: Option<Arc<dyn NetworkMonitor>>,
    settings: Option<Arc<dyn SettingsStore>>,
    clock: Arc<dyn Clock>,
    monotonic_clock: Arc<dyn MonotonicClock>,
    events: EventBus,
}

impl SyncOrchestratorBuilder {
    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Wall clock for persisted timestamps (default: system clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Monotonic clock for the breaker cooldown (default: system clock)
    pub fn monotonic_clock(mut self, clock: Arc<dyn MonotonicClock>) -> Self {
        self.monotonic_clock = clock;
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Validate the configuration and restore `last_sync_timestamp`.
    ///
    /// # Errors
    ///
    /// `Config` for an invalid configuration, `InvalidInput` when the remote
    /// store, network monitor or settings store is missing.
    pub async fn build(self) -> Result<SyncOrchestrator> {
        self.config.validate()?;

        let remote = self
            .remote
            .ok_or_else(|| SyncError::invalid_input("remote", "a remote store is required"))?;
        let network = self
            .network
            .ok_or_else(|| SyncError::invalid_input("network", "a network monitor is required"))?;
        let settings = self
            .settings
            .ok_or_else(|| SyncError::invalid_input("settings", "a settings store is required"))?;

        let last_sync = settings.get_i64(LAST_SYNC_KEY).await?;

        let records: Arc<dyn RecordRepository> =
            Arc::new(SqliteRecordRepository::new(self.pool.clone()));
        let tracker = ChangeTracker::new(self.pool.clone(), records.clone(), self.clock.clone())
            .with_tenant(self.config.tenant_id.clone());
        let queue = SyncQueue::new(self.pool.clone(), self.clock.clone())
            .with_policy(RetryPolicy::from_config(&self.config))
            .with_event_bus(self.events.clone());
        let breaker = CircuitBreaker::new(
            self.config.breaker_threshold,
            self.config.breaker_cooldown,
            self.monotonic_clock,
        );

        info!(
            device_id = %self.config.device_id,
            last_sync = ?last_sync,
            "Sync orchestrator ready"
        );

        Ok(SyncOrchestrator {
            resolver: ConflictResolver::new(self.config.device_id.clone(), self.clock.clone()),
            integrity: IntegrityProbe::new(self.pool),
            state: SyncEngineState::new(last_sync),
            config: self.config,
            records,
            tracker,
            queue,
            breaker,
            remote,
            network,
            settings,
            clock: self.clock,
            events: self.events,
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct SyncOrchestrator {
    config: SyncEngineConfig,
    records: Arc<dyn RecordRepository>,
    tracker: ChangeTracker,
    queue: SyncQueue,
    resolver: ConflictResolver,
    breaker: CircuitBreaker,
    remote: Arc<dyn RemoteStore>,
    network: Arc<dyn NetworkMonitor>,
    settings: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    integrity: IntegrityProbe,
    state: SyncEngineState,
}

impl SyncOrchestrator {
    pub fn builder(config: SyncEngineConfig, pool: SqlitePool) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder {
            config,
            pool,
            remote: None,
            network: None,
            settings: None,
            clock: Arc::new(SystemClock),
            monotonic_clock: Arc::new(SystemMonotonicClock::new()),
            events: EventBus::default(),
        }
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn state(&self) -> &SyncEngineState {
        &self.state
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    // ------------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------------

    /// Persist a local write and schedule it for upload.
    ///
    /// Only fields that differ from the stored copy are stamped, logged and
    /// enqueued. Writing an identical record is a no-op.
    ///
    /// # Errors
    ///
    /// `Store(InvalidInput)` when the record fails validation.
    #[instrument(skip(self, record), fields(table = %record.table(), record_id = %record.id()))]
    pub async fn record_local_change(&self, record: &Record) -> Result<CrdtRecord> {
        let table = record.table();
        let incoming = CrdtRecord::from_record(record)?;

        let existing = self.records.find(table, &incoming.id).await?;
        let operation = if existing.is_some() {
            Operation::Update
        } else {
            Operation::Insert
        };
        let base = existing.unwrap_or_else(|| {
            CrdtRecord::new(incoming.id.clone()).with_tenant(self.config.tenant_id.clone())
        });

        let changes: FieldMap = incoming
            .fields
            .iter()
            .filter(|(field, value)| base.fields.get(*field) != Some(*value))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();

        if changes.is_empty() {
            debug!("Local write has no changes");
            return Ok(base);
        }

        let previous: FieldMap = changes
            .keys()
            .filter_map(|field| base.fields.get(field).map(|v| (field.clone(), v.clone())))
            .collect();

        let updated = self.resolver.update_record(&base, &changes);
        self.records.upsert(table, &updated).await?;

        if operation == Operation::Update {
            self.tracker
                .log_change_with_previous(table.as_str(), &updated.id, operation, changes, previous)
                .await?;
        } else {
            self.tracker
                .log_change(table.as_str(), &updated.id, operation, changes)
                .await?;
        }

        self.queue
            .add_to_queue(
                table.as_str(),
                &updated.id,
                operation,
                QueueOptions::for_table(table.as_str()),
            )
            .await?;

        Ok(updated)
    }

    /// Delete a record locally and schedule the tombstone for upload.
    ///
    /// Returns `false` when the record did not exist.
    #[instrument(skip(self))]
    pub async fn delete_local_record(&self, table: TableKind, record_id: &str) -> Result<bool> {
        if !self.records.delete(table, record_id).await? {
            return Ok(false);
        }

        self.tracker
            .log_change(table.as_str(), record_id, Operation::Delete, FieldMap::new())
            .await?;
        self.queue
            .add_to_queue(
                table.as_str(),
                record_id,
                Operation::Delete,
                QueueOptions::for_table(table.as_str()),
            )
            .await?;

        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Sync pass
    // ------------------------------------------------------------------------

    /// Run one sync pass. Never fails; problems are reported in the result.
    #[instrument(skip(self, options), fields(trigger = %options.trigger, force = options.force))]
    pub async fn sync(&self, options: SyncOptions) -> SyncResult {
        let started_at = self.clock.unix_timestamp_millis();

        if !self.is_online().await {
            debug!("Skipping sync while offline");
            return SyncResult::rejected(SyncError::Offline.to_string(), started_at);
        }

        let Some(_guard) = self.state.begin(options.force) else {
            debug!("Sync already in progress");
            return SyncResult::rejected(SyncError::SyncInProgress.to_string(), started_at);
        };

        if !self.breaker.try_acquire(options.bypass_circuit) {
            debug!("Circuit breaker open, skipping sync");
            return SyncResult::rejected(SyncError::CircuitOpen.to_string(), started_at);
        }

        let token = self.state.cancellation_token();
        let mut pass = SyncPass::new(options.trigger.clone(), options.force, started_at);

        self.emit(SyncEvent::Started {
            pass_id: pass.id.to_string(),
            trigger: pass.trigger.clone(),
            forced: pass.forced,
        });
        info!(pass_id = %pass.id, "Sync pass started");

        let outcome = self.run_pass(&mut pass, &token, &options).await;
        self.finish_pass(&mut pass, outcome, &options).await;

        pass.into_result()
    }

    async fn run_pass(
        &self,
        pass: &mut SyncPass,
        token: &CancellationToken,
        options: &SyncOptions,
    ) -> Result<()> {
        self.advance(pass, SyncPhase::Uploading)?;
        pass.uploaded = self.upload(pass, token, options).await?;
        check_cancelled(token)?;

        self.advance(pass, SyncPhase::Downloading)?;
        let (downloaded, conflicts) = self.download(pass, token, options).await?;
        pass.downloaded = downloaded;
        pass.conflicts = conflicts;
        check_cancelled(token)?;

        self.advance(pass, SyncPhase::Verifying)?;
        self.verify(pass, token, options).await?;
        check_cancelled(token)?;

        Ok(())
    }

    async fn finish_pass(&self, pass: &mut SyncPass, outcome: Result<()>, options: &SyncOptions) {
        let pass_id = pass.id.to_string();

        match outcome {
            Ok(()) => {
                self.advance_to_end(pass, SyncPhase::Complete);

                self.state.set_last_sync(pass.started_at);
                if let Err(e) = self.settings.set_i64(LAST_SYNC_KEY, pass.started_at).await {
                    warn!(error = %e, "Failed to persist last sync timestamp");
                }

                if let Some(CircuitTransition::Closed) = self.breaker.record_success() {
                    self.emit(SyncEvent::CircuitClosed);
                }

                match self.run_maintenance().await {
                    Ok(report) if report.changes_cleared > 0 => {
                        debug!(cleared = report.changes_cleared, "Swept old change log entries");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Change log retention sweep failed"),
                }

                self.report(options, pass, "complete", 1, Some(1));
                self.emit(SyncEvent::Completed {
                    pass_id,
                    uploaded: pass.uploaded,
                    downloaded: pass.downloaded,
                    conflicts: pass.conflicts,
                    duration_ms: pass.duration_ms().unwrap_or(0),
                });

                info!(
                    uploaded = pass.uploaded,
                    downloaded = pass.downloaded,
                    conflicts = pass.conflicts,
                    "Sync pass completed"
                );
            }
            Err(SyncError::Cancelled) => {
                self.advance_to_end(pass, SyncPhase::Cancelled);
                pass.errors.push(SyncError::Cancelled.to_string());
                self.breaker.release_trial();
                self.emit(SyncEvent::Cancelled { pass_id });
                info!("Sync pass cancelled");
            }
            Err(e) => {
                self.advance_to_end(pass, SyncPhase::Failed);
                pass.errors.push(e.to_string());

                if let Some(CircuitTransition::Opened {
                    consecutive_failures,
                }) = self.breaker.record_failure()
                {
                    self.emit(SyncEvent::CircuitOpened {
                        consecutive_failures,
                        cooldown_secs: self.breaker.cooldown().as_secs(),
                    });
                }

                self.emit(SyncEvent::Failed {
                    pass_id,
                    message: e.to_string(),
                    recoverable: e.is_transient(),
                });
                error!(error = %e, "Sync pass failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------------

    async fn upload(
        &self,
        pass: &mut SyncPass,
        token: &CancellationToken,
        options: &SyncOptions,
    ) -> Result<u64> {
        let now = self.clock.unix_timestamp_millis();
        self.queue.clamp_backoff(now).await?;
        let chunks = self
            .tracker
            .create_upload_batches(self.config.batch_size)
            .await?;
        let total = chunks.iter().map(Vec::len).sum::<usize>() as u64;

        self.report(options, pass, "upload", 0, Some(total));

        let mut processed = 0u64;
        let mut uploaded = 0u64;

        for chunk in chunks {
            check_cancelled(token)?;

            let mut eligible = Vec::with_capacity(chunk.len());
            for batch in chunk {
                if self.prepare_for_upload(&batch, now).await? {
                    eligible.push(batch);
                } else {
                    processed += 1;
                }
            }

            for (table, batches) in group_by_table(eligible) {
                let count = batches.len() as u64;

                match self.push_table(&table, &batches, token).await {
                    Ok(()) => {
                        for batch in &batches {
                            self.settle_success(batch).await?;
                        }
                        uploaded += count;
                    }
                    Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                    Err(e) => {
                        warn!(table = %table, records = count, error = %e, "Upload chunk failed");
                        pass.errors.push(format!("{}: {}", table, e));
                        for batch in &batches {
                            self.settle_failure(batch, &e).await?;
                        }
                    }
                }

                processed += count;
                self.report(options, pass, "upload", processed, Some(total));
            }
        }

        Ok(uploaded)
    }

    /// Make sure the record has a queue item, and decide whether it may be
    /// uploaded now. Dead-lettered records and records in backoff wait.
    async fn prepare_for_upload(&self, batch: &DeltaBatch, now: i64) -> Result<bool> {
        if self
            .queue
            .error_log()
            .has_entry(&batch.table_name, &batch.record_id)
            .await?
        {
            debug!(
                table = %batch.table_name,
                record_id = %batch.record_id,
                "Skipping dead-lettered record"
            );
            return Ok(false);
        }

        let items = self
            .queue
            .items_for_record(&batch.table_name, &batch.record_id)
            .await?;

        if items.is_empty() {
            self.queue
                .add_to_queue(
                    &batch.table_name,
                    &batch.record_id,
                    batch.operation(),
                    QueueOptions::for_table(&batch.table_name),
                )
                .await?;
            return Ok(true);
        }

        Ok(items.iter().all(|item| item.is_ready(now)))
    }

    async fn push_table(
        &self,
        table: &str,
        batches: &[DeltaBatch],
        token: &CancellationToken,
    ) -> Result<()> {
        let mut upserts = Vec::new();

        for batch in batches {
            if batch.is_tombstone() {
                self.remote_call(token, self.remote.delete(table, &batch.record_id))
                    .await?;
            } else {
                upserts.push(self.upload_payload(batch).await?);
            }
        }

        if !upserts.is_empty() {
            self.remote_call(token, self.remote.upsert_batch(table, &upserts))
                .await?;
        }

        Ok(())
    }

    /// Local snapshot with the delta overlaid; values the snapshot lacks are
    /// stamped as writes of this device.
    async fn upload_payload(&self, batch: &DeltaBatch) -> Result<CrdtRecord> {
        let local = match TableKind::parse(&batch.table_name) {
            Some(table) => self.records.find(table, &batch.record_id).await?,
            None => None,
        };
        let snapshot = local.unwrap_or_else(|| {
            CrdtRecord::new(batch.record_id.clone()).with_tenant(self.config.tenant_id.clone())
        });

        let missing: FieldMap = batch
            .field_values()
            .into_iter()
            .filter(|(field, value)| field != "id" && snapshot.fields.get(field) != Some(value))
            .collect();

        if missing.is_empty() {
            Ok(snapshot)
        } else {
            Ok(self.resolver.update_record(&snapshot, &missing))
        }
    }

    async fn settle_success(&self, batch: &DeltaBatch) -> Result<()> {
        self.tracker
            .mark_changes_synced_through(&batch.table_name, &batch.record_id, batch.timestamp)
            .await?;

        for item in self
            .queue
            .items_for_record(&batch.table_name, &batch.record_id)
            .await?
        {
            self.queue.mark_as_synced(&item.id).await?;
        }

        if batch.is_tombstone() {
            return Ok(());
        }
        if let Some(table) = TableKind::parse(&batch.table_name) {
            match self.records.mark_synced(table, &batch.record_id).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn settle_failure(&self, batch: &DeltaBatch, error: &SyncError) -> Result<()> {
        let message = error.to_string();
        for item in self
            .queue
            .items_for_record(&batch.table_name, &batch.record_id)
            .await?
        {
            self.queue.record_failure(&item.id, &message).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------------

    async fn download(
        &self,
        pass: &SyncPass,
        token: &CancellationToken,
        options: &SyncOptions,
    ) -> Result<(u64, u64)> {
        let since = self.state.last_sync_timestamp().unwrap_or(0);
        let mut downloaded = 0u64;
        let mut conflicts = 0u64;

        self.report(options, pass, "download", 0, None);

        for table in TableKind::ALL {
            check_cancelled(token)?;

            let changes = self
                .remote_call(token, self.remote.fetch_changes_since(table.as_str(), since))
                .await?;

            for change in changes {
                check_cancelled(token)?;
                match change {
                    RemoteChange::Deleted { record_id } => {
                        self.records.delete(table, &record_id).await?;
                        self.drop_pending(table, &record_id).await?;
                    }
                    RemoteChange::Upserted(remote) => {
                        if self.apply_remote(table, remote).await? {
                            conflicts += 1;
                        }
                    }
                }
                downloaded += 1;
            }

            self.report(options, pass, "download", downloaded, None);
        }

        Ok((downloaded, conflicts))
    }

    /// A remote tombstone outranks local edits still waiting to upload.
    async fn drop_pending(&self, table: TableKind, record_id: &str) -> Result<()> {
        let changes = self
            .tracker
            .mark_changes_synced(table.as_str(), record_id)
            .await?;
        let items = self.queue.remove_record(table.as_str(), record_id).await?;
        if changes > 0 || items > 0 {
            debug!(
                table = %table,
                record_id = %record_id,
                changes,
                items,
                "Dropped local edits of a remotely deleted record"
            );
        }
        Ok(())
    }

    /// Merge one remote record. Returns whether the merge reported conflicts.
    async fn apply_remote(&self, table: TableKind, remote: CrdtRecord) -> Result<bool> {
        let Some(local) = self.records.find(table, &remote.id).await? else {
            self.records
                .upsert(table, &CrdtRecord { synced: true, ..remote })
                .await?;
            return Ok(false);
        };

        let resolution = self.resolver.resolve(&local, &remote, table.conflict_kind());
        let has_conflicts = resolution.has_conflicts();
        let mut resolved = resolution.resolved;

        if same_content(&resolved, &remote) {
            resolved.synced = true;
        } else if table.conflict_kind() == core_store::ConflictKind::Editable {
            // The remote copy lacks local writes; send the merge back
            resolved.synced = false;
            if !resolved.fields.is_empty() {
                self.tracker
                    .log_change(
                        table.as_str(),
                        &resolved.id,
                        Operation::Update,
                        resolved.fields.clone(),
                    )
                    .await?;
                self.queue
                    .add_to_queue(
                        table.as_str(),
                        &resolved.id,
                        Operation::Update,
                        QueueOptions::for_table(table.as_str()),
                    )
                    .await?;
            }
        }

        if has_conflicts {
            debug!(
                table = %table,
                record_id = %resolved.id,
                strategy = resolution.strategy.as_str(),
                "Resolved conflicting fields"
            );
        }

        self.records.upsert(table, &resolved).await?;
        Ok(has_conflicts)
    }

    // ------------------------------------------------------------------------
    // Verify
    // ------------------------------------------------------------------------

    async fn verify(
        &self,
        pass: &SyncPass,
        token: &CancellationToken,
        options: &SyncOptions,
    ) -> Result<()> {
        self.report(options, pass, "verify", 0, Some(1));

        let report = self.integrity.run().await?;
        if !report.is_healthy() {
            warn!(
                quick_check = ?report.quick_check,
                undecodable = report.undecodable.len(),
                unknown_tables = ?report.unknown_tables,
                "Local store failed integrity check, rebuilding from remote"
            );
            self.rebuild(token).await?;
        }

        self.report(options, pass, "verify", 1, Some(1));
        Ok(())
    }

    /// Replace every local record with the remote copy. Returns the number
    /// of records restored. Pending local changes stay in the change log.
    #[instrument(skip(self))]
    pub async fn rebuild_from_remote(&self) -> Result<u64> {
        let token = self.state.cancellation_token();
        self.rebuild(&token).await
    }

    async fn rebuild(&self, token: &CancellationToken) -> Result<u64> {
        let mut fetched = Vec::new();
        for table in TableKind::ALL {
            let records = self
                .remote_call(token, self.remote.fetch_all(table.as_str()))
                .await?;
            fetched.push((table, records));
        }

        let cleared = self.records.clear().await?;
        let mut restored = 0u64;
        for (table, records) in fetched {
            for record in records {
                self.records
                    .upsert(table, &CrdtRecord { synced: true, ..record })
                    .await?;
                restored += 1;
            }
        }

        info!(cleared, restored, "Rebuilt local store from remote");
        Ok(restored)
    }

    // ------------------------------------------------------------------------
    // Queries and controls
    // ------------------------------------------------------------------------

    pub async fn get_connection_status(&self) -> ConnectionStatus {
        match self.network.get_network_info().await {
            Ok(info) => ConnectionStatus {
                online: info.is_online(),
                connection_type: info
                    .network_type
                    .map(|kind| format!("{:?}", kind).to_lowercase()),
                effective_type: info.effective_type.map(|e| e.as_str().to_string()),
            },
            Err(e) => {
                warn!(error = %e, "Network status unavailable, assuming offline");
                ConnectionStatus::offline()
            }
        }
    }

    pub async fn is_online(&self) -> bool {
        self.get_connection_status().await.online
    }

    pub fn is_currently_syncing(&self) -> bool {
        self.state.is_syncing()
    }

    pub fn get_last_sync_timestamp(&self) -> Option<i64> {
        self.state.last_sync_timestamp()
    }

    pub async fn get_queue_size(&self) -> Result<u64> {
        self.queue.queue_size().await
    }

    pub async fn get_pending_operations(&self, limit: Option<usize>) -> Result<Vec<SyncQueueItem>> {
        self.queue.get_pending_operations(limit).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<SyncErrorEntry>> {
        self.queue.dead_letters().await
    }

    /// Clear the dead-letter log so the affected records are uploaded again.
    pub async fn clear_dead_letters(&self) -> Result<u64> {
        self.queue.clear_dead_letters().await
    }

    /// Ask running passes to stop at the next checkpoint. Returns `false`
    /// when nothing was running.
    pub fn cancel_sync(&self) -> bool {
        let cancelled = self.state.cancel();
        if cancelled {
            info!("Sync cancellation requested");
        }
        cancelled
    }

    /// Apply the change-log retention sweep. Successful passes run it too.
    #[instrument(skip(self))]
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let changes_cleared = self
            .tracker
            .clear_old_synced_changes(self.config.change_retention_days)
            .await?;
        Ok(MaintenanceReport { changes_cleared })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn remote_call<T>(
        &self,
        token: &CancellationToken,
        call: impl Future<Output = RemoteResult<T>>,
    ) -> Result<T> {
        let result = timeout(self.config.sync_timeout, call).await;

        // Results that arrive after a cancellation are discarded
        check_cancelled(token)?;

        match result {
            Ok(inner) => inner.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(self.config.sync_timeout.as_secs())),
        }
    }

    fn advance(&self, pass: &mut SyncPass, to: SyncPhase) -> Result<()> {
        pass.transition(to, self.clock.unix_timestamp_millis())?;
        self.state.set_phase(to);
        Ok(())
    }

    fn advance_to_end(&self, pass: &mut SyncPass, to: SyncPhase) {
        if let Err(e) = self.advance(pass, to) {
            warn!(error = %e, "Unexpected pass transition");
        }
    }

    fn report(
        &self,
        options: &SyncOptions,
        pass: &SyncPass,
        phase: &str,
        processed: u64,
        total: Option<u64>,
    ) {
        let progress = SyncProgress::new(pass.id, phase, processed, total);

        self.emit(SyncEvent::Progress {
            pass_id: pass.id.to_string(),
            phase: progress.phase.clone(),
            processed,
            total,
            percent: progress.percent,
        });

        if let Some(callback) = &options.on_progress {
            callback(progress);
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.emit(CoreEvent::Sync(event));
    }
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

/// Split batches by table, keeping first-appearance order.
fn group_by_table(batches: Vec<DeltaBatch>) -> Vec<(String, Vec<DeltaBatch>)> {
    let mut groups: Vec<(String, Vec<DeltaBatch>)> = Vec::new();
    for batch in batches {
        match groups.iter_mut().find(|(table, _)| *table == batch.table_name) {
            Some((_, group)) => group.push(batch),
            None => groups.push((batch.table_name.clone(), vec![batch])),
        }
    }
    groups
}

fn same_content(a: &CrdtRecord, b: &CrdtRecord) -> bool {
    a.fields == b.fields
        && a.version_vector == b.version_vector
        && a.field_versions == b.field_versions
        && a.tenant_id == b.tenant_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(table: &str, id: &str) -> DeltaBatch {
        DeltaBatch {
            table_name: table.to_string(),
            record_id: id.to_string(),
            changes: Vec::new(),
            compressed: true,
            timestamp: 0,
        }
    }

    #[test]
    fn test_group_by_table_keeps_order() {
        let groups = group_by_table(vec![
            batch("pagos", "p1"),
            batch("creditos", "c1"),
            batch("pagos", "p2"),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "pagos");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "creditos");
    }

    #[test]
    fn test_guard_rejects_second_unforced_pass() {
        let state = SyncEngineState::new(None);

        let first = state.begin(false);
        assert!(first.is_some());
        assert!(state.begin(false).is_none());

        let forced = state.begin(true);
        assert!(forced.is_some());
        assert!(state.is_syncing());

        drop(first);
        drop(forced);
        assert!(!state.is_syncing());
        assert!(state.begin(false).is_some());
    }

    #[test]
    fn test_cancel_installs_fresh_token() {
        let state = SyncEngineState::new(Some(5));
        assert!(!state.cancel());

        let _guard = state.begin(false);
        let token = state.cancellation_token();
        assert!(state.cancel());
        assert!(token.is_cancelled());
        assert!(!state.cancellation_token().is_cancelled());
        assert_eq!(state.last_sync_timestamp(), Some(5));
    }

    #[test]
    fn test_sync_options_debug_hides_callback() {
        let options = SyncOptions::forced().with_progress(Arc::new(|_| {}));
        let debug = format!("{:?}", options);
        assert!(debug.contains("force: true"));
        assert!(debug.contains("on_progress: true"));
    }
}
