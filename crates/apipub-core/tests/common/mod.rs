//! Shared fixtures for the integration tests
#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use apipub_common::Result;
use apipub_core::client::ApiClient;
use apipub_core::config::{ConnectionConfig, PublisherConfig, DEFAULT_TRANSIENT_STATUS_CODES};
use apipub_core::document::{into_document, Document};
use apipub_core::error_publishing::{ErrorAggregator, ErrorPublisher, ErrorSink};
use apipub_core::model::ErrorRecord;
use apipub_core::retry::{RetryPolicy, RetrySettings};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use wiremock::MockServer;

pub fn connection(name: &str, server: &MockServer) -> ConnectionConfig {
    ConnectionConfig::new(name, server.uri())
}

pub fn client(name: &str, server: &MockServer) -> Arc<ApiClient> {
    Arc::new(ApiClient::new(&connection(name, server), Duration::from_secs(5)).unwrap())
}

/// Fast retries so tests do not sleep.
pub fn retry(max_attempts: u32) -> RetrySettings {
    RetrySettings::new(
        RetryPolicy::new(Duration::from_millis(1), max_attempts),
        &DEFAULT_TRANSIENT_STATUS_CODES,
    )
}

pub fn doc(value: Value) -> Document {
    into_document(value).unwrap()
}

pub fn publisher_config(source: &MockServer, target: &MockServer) -> PublisherConfig {
    let mut config = PublisherConfig::new(connection("Source", source), connection("Target", target));
    config.options.retry_starting_delay_milliseconds = 1;
    config.options.max_retry_attempts = 3;
    config.options.streaming_page_size = 10;
    config
}

/// Sink that keeps every record it receives.
#[derive(Default)]
pub struct CollectingSink {
    records: Mutex<Vec<ErrorRecord>>,
}

impl CollectingSink {
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl ErrorSink for CollectingSink {
    async fn publish(&self, batch: &[ErrorRecord]) -> Result<()> {
        self.records.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }
}

/// An aggregator over a fresh collecting sink.
pub fn error_channel() -> (Arc<CollectingSink>, ErrorPublisher, JoinHandle<usize>) {
    let sink = Arc::new(CollectingSink::default());
    let (publisher, handle) = ErrorAggregator::spawn(sink.clone(), 10, 10);
    (sink, publisher, handle)
}

/// Drop the publisher, wait for the flush, and return what reached the sink.
pub async fn drain_errors(
    sink: Arc<CollectingSink>,
    publisher: ErrorPublisher,
    handle: JoinHandle<usize>,
) -> Vec<ErrorRecord> {
    drop(publisher);
    handle.await.unwrap();
    sink.records()
}
