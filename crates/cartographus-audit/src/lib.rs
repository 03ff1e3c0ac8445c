#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cartographus-audit** – The security Audit Logger (§4.10): a second
//! instantiation of the Batch Writer pattern dedicated to the
//! `audit_events` table, plus a CEF exporter for SIEM ingestion (§6).

mod cef;
mod error;
mod logger;

pub use cef::to_cef;
pub use error::{AuditError, Result};
pub use logger::AuditLogger;
