//! # Repository Pattern Implementation
//!
//! Repository traits and their SQLite implementations.
//!
//! - Traits define the interface, so sync components can be tested against fakes
//! - SQLite implementations use sqlx for async database access
//! - All operations return `Result<T>`

pub mod record;

pub use record::{RecordRepository, SqliteRecordRepository};
