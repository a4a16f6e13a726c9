//! Batching of error records
//!
//! The aggregator owns the receiving end of a bounded channel. It closes when
//! every [`ErrorPublisher`] clone has been dropped, flushing the partial batch.

use super::sinks::ErrorSink;
use crate::model::ErrorRecord;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Handle used by pipeline stages to report error records.
///
/// Each handle counts what it published; [`ErrorPublisher::scoped`] starts a
/// fresh count over the same channel.
#[derive(Debug, Clone)]
pub struct ErrorPublisher {
    tx: mpsc::Sender<ErrorRecord>,
    published: Arc<AtomicUsize>,
}

impl ErrorPublisher {
    /// A handle on the same channel with its own counter.
    pub fn scoped(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            published: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Log the record and queue it for the sink.
    pub async fn publish(&self, record: ErrorRecord) {
        error!(
            resource = %record.resource_url,
            method = %record.method,
            id = %record.id,
            status = ?record.response_status,
            response = %record.response_content,
            "Failed to publish item"
        );

        self.published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(record).await.is_err() {
            warn!("Error aggregator is closed; dropping error record");
        }
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

pub struct ErrorAggregator;

impl ErrorAggregator {
    /// Start the aggregator task.
    ///
    /// The join handle resolves to the number of records received once all
    /// publishers are dropped and the final batch is flushed.
    pub fn spawn(
        sink: Arc<dyn ErrorSink>,
        batch_size: usize,
        capacity: usize,
    ) -> (ErrorPublisher, JoinHandle<usize>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(Self::run(sink, batch_size.max(1), rx));

        let publisher = ErrorPublisher {
            tx,
            published: Arc::new(AtomicUsize::new(0)),
        };
        (publisher, handle)
    }

    async fn run(
        sink: Arc<dyn ErrorSink>,
        batch_size: usize,
        mut rx: mpsc::Receiver<ErrorRecord>,
    ) -> usize {
        let mut batch = Vec::with_capacity(batch_size);
        let mut received = 0;

        while let Some(record) = rx.recv().await {
            received += 1;
            batch.push(record);
            if batch.len() >= batch_size {
                Self::flush(sink.as_ref(), &mut batch).await;
            }
        }

        if !batch.is_empty() {
            Self::flush(sink.as_ref(), &mut batch).await;
        }
        received
    }

    async fn flush(sink: &dyn ErrorSink, batch: &mut Vec<ErrorRecord>) {
        debug!(count = batch.len(), "Flushing error batch");
        if let Err(e) = sink.publish(batch).await {
            error!(count = batch.len(), error = %e, "Error sink failed; batch discarded");
        }
        batch.clear();
    }
}
