//! Per-resource pipeline
//!
//! ```text
//! streamer --PageRequest--> fetchers (N) --ActionMessage--> processors (M) --> errors
//! ```
//!
//! Each stage runs as its own task connected by bounded channels, so a slow
//! processor stage blocks page fetching rather than buffering a whole
//! resource. A stage finishes when its input channel closes; dropping its
//! sender then closes the next stage in turn.

use crate::document::Document;
use crate::error_publishing::ErrorPublisher;
use crate::model::{ActionMessage, UpsertMessage};
use crate::processing::ActionProcessor;
use crate::streaming::{ActionMessageProducer, PageFetcher, PagedResourceStreamer, ResourceStreamRequest};
use apipub_common::{PublisherError, Result};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What happened to one resource in one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceSummary {
    pub resource_url: String,
    pub pages: u64,
    pub messages: usize,
    pub errors: usize,
    pub cancelled: bool,
}

impl ResourceSummary {
    pub fn new(resource_url: impl Into<String>) -> Self {
        Self {
            resource_url: resource_url.into(),
            ..Default::default()
        }
    }
}

/// Tuning for the source-side stages.
#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub page_parallelism: usize,
    pub pages_channel_capacity: usize,
    pub items_channel_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ResourcePipeline {
    streamer: PagedResourceStreamer,
    fetcher: PageFetcher,
    limits: PipelineLimits,
}

impl ResourcePipeline {
    pub fn new(streamer: PagedResourceStreamer, fetcher: PageFetcher, limits: PipelineLimits) -> Self {
        Self {
            streamer,
            fetcher,
            limits,
        }
    }

    /// Stream, fetch and process one resource to completion.
    pub async fn run(
        &self,
        request: ResourceStreamRequest,
        producer: Arc<dyn ActionMessageProducer>,
        processor: Arc<dyn ActionProcessor>,
        errors: &ErrorPublisher,
    ) -> Result<ResourceSummary> {
        let resource_url = request.resource_url.clone();
        let cancellation = request.cancellation.clone();
        let errors = errors.scoped();

        let (page_tx, page_rx) = mpsc::channel(self.limits.pages_channel_capacity.max(1));
        let (message_tx, message_rx) = mpsc::channel(self.limits.items_channel_capacity.max(1));

        let stream_task: JoinHandle<Result<u64>> = {
            let streamer = self.streamer.clone();
            let errors = errors.clone();
            tokio::spawn(async move { streamer.stream(request, page_tx, &errors).await })
        };

        let fetch_task: JoinHandle<Result<usize>> = {
            let fetcher = self.fetcher.clone();
            let cancellation = cancellation.clone();
            let errors = errors.clone();
            let parallelism = self.limits.page_parallelism.max(1);
            tokio::spawn(async move {
                let produced = AtomicUsize::new(0);
                let (fetcher, producer, cancellation, message_tx, errors, produced) =
                    (&fetcher, producer.as_ref(), &cancellation, &message_tx, &errors, &produced);

                ReceiverStream::new(page_rx)
                    .map(Ok::<_, PublisherError>)
                    .try_for_each_concurrent(parallelism, |page| async move {
                        let sent = fetcher.fetch(page, producer, cancellation, message_tx, errors).await?;
                        produced.fetch_add(sent, Ordering::Relaxed);
                        Ok(())
                    })
                    .await?;

                Ok(produced.load(Ordering::Relaxed))
            })
        };

        let process_task = tokio::spawn(process_messages(
            processor,
            message_rx,
            cancellation.clone(),
            errors.clone(),
        ));

        let pages = join_stage(&resource_url, "streaming", stream_task).await;
        let messages = join_stage(&resource_url, "fetching", fetch_task).await;
        let processed = join_stage(&resource_url, "processing", process_task).await;

        let summary = ResourceSummary {
            resource_url,
            pages: pages?,
            messages: messages?,
            errors: errors.published(),
            cancelled: cancellation.is_cancelled(),
        };
        processed?;

        info!(
            resource = %summary.resource_url,
            pages = summary.pages,
            messages = summary.messages,
            errors = summary.errors,
            cancelled = summary.cancelled,
            "Resource complete"
        );
        Ok(summary)
    }

    /// Replay items deferred by an authorization failure.
    ///
    /// The replayed messages carry no continuation, so a second 403 is final.
    /// Items left when `cancellation` fires are dropped unprocessed.
    pub async fn replay(
        &self,
        resource_url: &str,
        items: Vec<Document>,
        processor: Arc<dyn ActionProcessor>,
        cancellation: CancellationToken,
        errors: &ErrorPublisher,
    ) -> Result<ResourceSummary> {
        let errors = errors.scoped();
        let count = items.len();
        let (message_tx, message_rx) = mpsc::channel(count.max(1));

        for item in items {
            let message = ActionMessage::Upsert(UpsertMessage {
                resource_url: resource_url.to_string(),
                item,
                authorization_retry: None,
            });
            if message_tx.send(message).await.is_err() {
                break;
            }
        }
        drop(message_tx);

        let processed = process_messages(processor, message_rx, cancellation.clone(), errors.clone()).await?;

        info!(
            resource = %resource_url,
            items = count,
            processed,
            errors = errors.published(),
            "Deferred items replayed"
        );
        Ok(ResourceSummary {
            resource_url: resource_url.to_string(),
            pages: 0,
            messages: processed,
            errors: errors.published(),
            cancelled: cancellation.is_cancelled(),
        })
    }
}

/// Run a processor pool over a message channel until it closes.
///
/// Once `cancellation` fires, remaining messages are drained unprocessed.
/// Returns the number of messages processed.
pub async fn process_messages(
    processor: Arc<dyn ActionProcessor>,
    messages: mpsc::Receiver<ActionMessage>,
    cancellation: CancellationToken,
    errors: ErrorPublisher,
) -> Result<usize> {
    let processed = AtomicUsize::new(0);
    let parallelism = processor.max_degree_of_parallelism();
    let (processor, cancellation, errors, processed_ref) =
        (processor.as_ref(), &cancellation, &errors, &processed);

    ReceiverStream::new(messages)
        .map(Ok::<_, PublisherError>)
        .try_for_each_concurrent(parallelism, |message| async move {
            if cancellation.is_cancelled() {
                return Ok(());
            }

            let resource_url = message.resource_url().to_string();
            let kind = message.kind();
            match processor.process(message).await {
                Ok(Some(record)) => errors.publish(record).await,
                Ok(None) => {},
                Err(e) => {
                    error!(
                        resource = %resource_url,
                        stage = %processor.stage(),
                        message = kind,
                        error = %e,
                        "Unexpected failure while processing message"
                    );
                    return Err(e);
                },
            }
            processed_ref.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .await?;

    Ok(processed.load(Ordering::Relaxed))
}

async fn join_stage<T>(resource_url: &str, stage: &str, handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            debug!(resource = %resource_url, stage, "Stage task did not complete");
            Err(PublisherError::pipeline(
                format!("{} {}", resource_url, stage),
                format!("task failed: {}", e),
            ))
        },
    }
}
