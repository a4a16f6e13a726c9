//! Publishing of unrecoverable per-item failures
//!
//! Pipeline stages hand [`ErrorRecord`](crate::model::ErrorRecord)s to an
//! [`ErrorPublisher`]; a single aggregator task per stage batches them and
//! flushes each batch to an [`ErrorSink`].

pub mod aggregator;
pub mod sinks;

pub use aggregator::{ErrorAggregator, ErrorPublisher};
pub use sinks::{ErrorSink, FileErrorSink, LogErrorSink};
