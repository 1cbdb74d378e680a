//! # Local Store
//!
//! Owns the on-device SQLite database of the sync engine.
//!
//! ## Overview
//!
//! This crate manages:
//! - The connection pool and embedded schema migrations
//! - Typed records for clients, loans, installments and payments
//! - CRDT metadata (version vectors, per-field versions) stored next to each record
//! - The integrity probe used to decide when to rebuild from the remote store

pub mod db;
pub mod error;
pub mod integrity;
pub mod models;
pub mod repositories;

pub use error::{Result, StoreError};
pub use integrity::{IntegrityProbe, IntegrityReport};
pub use models::{
    upload_priority, Cliente, ConflictKind, CrdtRecord, Credito, Cuota, EstadoCredito, FieldMap,
    FieldVersion, Pago, Record, TableKind, VersionVector,
};
pub use repositories::{RecordRepository, SqliteRecordRepository};
