//! # Sync Engine
//!
//! Offline-first synchronization of the lending tables (`clientes`,
//! `creditos`, `cuotas`, `pagos`) between the local SQLite store and a
//! remote record store.
//!
//! ## Overview
//!
//! Local writes are applied immediately, recorded in a change log and queued
//! for upload. A sync pass pushes compressed per-record deltas, pulls remote
//! changes, merges them with CRDT metadata and checks the local store for
//! damage. Failures back off per queue item and, when they persist, open a
//! circuit breaker.
//!
//! ## Components
//!
//! - **Version Vectors** (`version_vector`): Causality between record snapshots
//! - **Conflict Resolver** (`conflict_resolver`): Field-level last-writer-wins merge
//! - **Change Tracker** (`change_tracker`): Change log, delta compression and upload batching
//! - **Sync Queue** (`sync_queue`): Durable upload queue with backoff and dead-lettering
//! - **Error Log** (`error_log`): Dead-lettered operations
//! - **Circuit Breaker** (`circuit_breaker`): Pauses passes after repeated failures
//! - **Remote Store** (`remote`): Server abstraction plus an in-memory implementation
//! - **Sync Pass** (`pass`): Pass phases, progress and results
//! - **Orchestrator** (`orchestrator`): Runs passes end to end
//! - **Background Triggers** (`background`): Timer, connectivity, lifecycle and platform wakeups

pub mod background;
pub mod change_tracker;
pub mod circuit_breaker;
pub mod conflict_resolver;
pub mod error;
pub mod error_log;
pub mod orchestrator;
pub mod pass;
pub mod remote;
pub mod sync_queue;
pub mod version_vector;

pub use background::{BackgroundTrigger, RegisterOptions, SyncCallback, SyncTrigger};
pub use change_tracker::{
    chunk_batches, compress_batches, compress_changes, Change, ChangeLogEntry, ChangeLogStats,
    ChangeTracker, DeltaBatch, Operation,
};
pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitTransition};
pub use conflict_resolver::{
    compare_field_versions, create_field_version, resolve_conflict, update_record,
    ConflictResolution, ConflictResolver, ResolutionStrategy,
};
pub use error::{Result, SyncError};
pub use error_log::{ErrorLog, SyncErrorEntry};
pub use orchestrator::{
    ConnectionStatus, MaintenanceReport, ProgressCallback, SyncEngineState, SyncOptions,
    SyncOrchestrator, SyncOrchestratorBuilder,
};
pub use pass::{SyncPass, SyncPassId, SyncPhase, SyncProgress, SyncResult};
pub use remote::{InMemoryRemoteStore, RemoteChange, RemoteError, RemoteResult, RemoteStore};
pub use sync_queue::{
    FailureOutcome, Priority, QueueOptions, QueueStats, RetryPolicy, SyncQueue, SyncQueueItem,
};
pub use version_vector::Causality;
