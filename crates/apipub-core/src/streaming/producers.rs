//! Conversion of source items into action messages, one producer per stage.

use crate::document::{into_document, item_id, Document};
use crate::model::{
    ActionMessage, AuthorizationRetry, DeleteMessage, KeyChangeMessage, RetryQueue, UpsertMessage,
};
use apipub_common::Result;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Turns one source item into at most one action message.
///
/// Returning `Ok(None)` skips the item. A producer may cancel the resource when
/// the source cannot support the stage at all; the fetcher then stops.
pub trait ActionMessageProducer: Send + Sync {
    fn produce(&self, item: Value, cancellation: &CancellationToken) -> Result<Option<ActionMessage>>;
}

// ============================================================================
// Upserts
// ============================================================================

pub struct UpsertMessageProducer {
    resource_url: String,
    retry_queue: Option<RetryQueue>,
}

impl UpsertMessageProducer {
    pub fn new(resource_url: impl Into<String>) -> Self {
        Self {
            resource_url: resource_url.into(),
            retry_queue: None,
        }
    }

    /// Attach an authorization-retry continuation to every message.
    pub fn with_retry_queue(mut self, queue: RetryQueue) -> Self {
        self.retry_queue = Some(queue);
        self
    }
}

impl ActionMessageProducer for UpsertMessageProducer {
    fn produce(&self, item: Value, _cancellation: &CancellationToken) -> Result<Option<ActionMessage>> {
        let item = into_document(item)?;
        let authorization_retry = self
            .retry_queue
            .as_ref()
            .map(|queue| AuthorizationRetry::new(queue.clone(), item_id(&item)));

        Ok(Some(ActionMessage::Upsert(UpsertMessage {
            resource_url: self.resource_url.clone(),
            item,
            authorization_retry,
        })))
    }
}

// ============================================================================
// Key changes and deletes
// ============================================================================

fn take_object(item: &mut Document, field: &str) -> Option<Document> {
    match item.shift_remove(field) {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn cancel_for_missing_metadata(resource_url: &str, field: &str, cancellation: &CancellationToken) {
    if !cancellation.is_cancelled() {
        warn!(
            resource = %resource_url,
            field,
            "Source item lacks change metadata; the source API does not appear to support change queries. Skipping resource"
        );
    }
    cancellation.cancel();
}

pub struct KeyChangeMessageProducer {
    resource_url: String,
}

impl KeyChangeMessageProducer {
    pub fn new(resource_url: impl Into<String>) -> Self {
        Self {
            resource_url: resource_url.into(),
        }
    }
}

impl ActionMessageProducer for KeyChangeMessageProducer {
    fn produce(&self, item: Value, cancellation: &CancellationToken) -> Result<Option<ActionMessage>> {
        let mut item = into_document(item)?;
        let source_id = item_id(&item);

        let Some(old_key_values) = take_object(&mut item, "oldKeyValues") else {
            cancel_for_missing_metadata(&self.resource_url, "oldKeyValues", cancellation);
            return Ok(None);
        };
        let Some(new_key_values) = take_object(&mut item, "newKeyValues") else {
            cancel_for_missing_metadata(&self.resource_url, "newKeyValues", cancellation);
            return Ok(None);
        };

        Ok(Some(ActionMessage::KeyChange(KeyChangeMessage {
            resource_url: self.resource_url.clone(),
            source_id,
            old_key_values,
            new_key_values,
        })))
    }
}

pub struct DeleteMessageProducer {
    resource_url: String,
}

impl DeleteMessageProducer {
    pub fn new(resource_url: impl Into<String>) -> Self {
        Self {
            resource_url: resource_url.into(),
        }
    }
}

impl ActionMessageProducer for DeleteMessageProducer {
    fn produce(&self, item: Value, cancellation: &CancellationToken) -> Result<Option<ActionMessage>> {
        let mut item = into_document(item)?;
        let source_id = item_id(&item);

        let Some(key_values) = take_object(&mut item, "keyValues") else {
            cancel_for_missing_metadata(&self.resource_url, "keyValues", cancellation);
            return Ok(None);
        };

        Ok(Some(ActionMessage::Delete(DeleteMessage {
            resource_url: self.resource_url.clone(),
            source_id,
            key_values,
        })))
    }
}
