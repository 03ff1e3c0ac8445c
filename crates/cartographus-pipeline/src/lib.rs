#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cartographus-pipeline** – Dispatcher, Processor Pool, Batch Writer,
//! and retention sweeper (§4.3, §4.6, §4.7, §4.9).
//!
//! Ties the WAL, the embedded stream broker, the dedup fabric, and the
//! analytics store together into the durable pipeline described by §2:
//! the Dispatcher drains the WAL into the broker, the Processor Pool
//! pulls from the broker and hands unseen events to the Batch Writer,
//! and the Batch Writer's durability callback acks the original broker
//! delivery once the flush to the analytics store succeeds.

mod batch_writer;
mod dispatcher;
mod error;
mod processor;
mod retention;

pub use batch_writer::{BatchWriter, DurableSink, SubmitOutcome};
pub use dispatcher::Dispatcher;
pub use error::{PipelineError, Result};
pub use processor::ProcessorPool;
pub use retention::RetentionSweeper;
