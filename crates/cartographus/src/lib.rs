#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cartographus** – The wiring facade: opens the WAL, broker, dedup
//! fabric, and analytics store, then starts the Dispatcher, Processor
//! Pool, Batch Writer, Retention Sweeper, and Audit Logger over them
//! (§2, §4). This is the only crate that knows about every other crate
//! in the workspace; everything else depends only downward.

mod core;

pub use core::Cartographus;
