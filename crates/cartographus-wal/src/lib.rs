#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cartographus-wal** – Durable, lease-based write-ahead log.
//!
//! Events accepted by the Ingest Front-End are written here first. The
//! Dispatcher leases pending entries, publishes them to the broker, and
//! confirms or fails the lease depending on the outcome. A background
//! sweep reclaims expired leases and compacts settled entries, giving
//! the pipeline at-least-once delivery across restarts.

mod entry;
mod error;
mod sled_wal;
mod trait_def;

pub use entry::{WalEntry, WalEntryState, WalKey};
pub use error::{Result, WalError};
pub use sled_wal::SledWal;
pub use trait_def::{WalRecoveryResult, WriteAheadLog};
