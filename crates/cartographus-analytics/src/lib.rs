#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Columnar analytics store adapter for Cartographus.
//!
//! Backs the playback event table, the security audit trail, and the
//! dedup audit trail on a single `sqlx` SQLite pool, following the
//! `SqliteBackend` shape: open/in-memory constructors that run idempotent
//! schema creation, then a thin trait per logical table.

mod audit_store;
mod dedup_audit_store;
mod error;
mod filter;
mod playback;
mod schema;
mod sqlite_store;

pub use audit_store::AuditStore;
pub use error::{AnalyticsError, Result};
pub use filter::{OrderByColumn, QueryFilter, Stats};
pub use playback::{InsertBatchOutcome, PlaybackStore};
pub use schema::create_schema;
pub use sqlite_store::SqliteAnalyticsStore;
