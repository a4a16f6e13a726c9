//! Target-side action processors
//!
//! Each processor applies one kind of [`ActionMessage`] to the target API and
//! yields at most one [`ErrorRecord`]. `Err` is reserved for failures that
//! should abort the stage, such as a message routed to the wrong processor.

pub mod delete;
pub mod key_change;
pub mod upsert;

pub use delete::DeleteProcessor;
pub use key_change::KeyChangeProcessor;
pub use upsert::{UpsertProcessor, UpsertRunState};

use crate::client::{ApiClient, ApiResponse};
use crate::document::{key_values_query, Document};
use crate::model::{ActionMessage, ErrorRecord, PublishingStage};
use crate::retry::RetrySettings;
use apipub_common::{PublisherError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait ActionProcessor: Send + Sync {
    fn stage(&self) -> PublishingStage;

    /// Messages processed concurrently for one resource.
    fn max_degree_of_parallelism(&self) -> usize;

    async fn process(&self, message: ActionMessage) -> Result<Option<ErrorRecord>>;
}

pub(crate) fn unexpected_message(stage: PublishingStage, message: &ActionMessage) -> PublisherError {
    PublisherError::UnexpectedMessage {
        stage: stage.to_string(),
        message: format!("{} message for {}", message.kind(), message.resource_url()),
    }
}

/// Error record for a failed call, with no status when nothing was received.
pub(crate) fn failure_record(
    resource_url: &str,
    method: &str,
    id: &str,
    body: Option<Value>,
    outcome: &Result<ApiResponse>,
) -> ErrorRecord {
    match outcome {
        Ok(response) => ErrorRecord::new(
            resource_url,
            method,
            id,
            body,
            Some(response.status_code()),
            response.body.clone(),
        ),
        Err(e) => ErrorRecord::new(resource_url, method, id, body, None, e.to_string()),
    }
}

/// Mutex-guarded string set shared across concurrent attempts.
///
/// Membership is best-effort: two attempts may both miss before either
/// inserts, which costs at most one extra call.
#[derive(Debug, Default)]
pub struct ConcurrentSet {
    entries: Mutex<HashSet<String>>,
}

impl ConcurrentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }

    /// Returns `true` if the key was not already present.
    pub fn insert(&self, key: impl Into<String>) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.into())
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of looking up a target item by its natural key.
pub(crate) enum TargetLookup {
    Found(Document),
    NotFound,
    Failed(ErrorRecord),
}

/// GET `{resource}?{key=value&...}` on the target and take the first match.
pub(crate) async fn find_by_key_values(
    target: &ApiClient,
    retry: &RetrySettings,
    resource_url: &str,
    key_values: &Document,
    source_id: &str,
) -> TargetLookup {
    let lookup_url = format!("{}?{}", resource_url, key_values_query(key_values));
    let response = retry.send(|_| target.get(&lookup_url), false).await;

    let body = match &response {
        Ok(r) if r.is_success() => r.body.as_str(),
        _ => {
            return TargetLookup::Failed(failure_record(resource_url, "GET", source_id, None, &response));
        },
    };

    let items: Vec<Value> = match serde_json::from_str(body) {
        Ok(items) => items,
        Err(e) => {
            return TargetLookup::Failed(ErrorRecord::new(
                resource_url,
                "GET",
                source_id,
                None,
                response.as_ref().ok().map(ApiResponse::status_code),
                format!("lookup response is not a JSON array: {}", e),
            ));
        },
    };

    match items.into_iter().next() {
        Some(Value::Object(item)) => TargetLookup::Found(item),
        Some(_) => TargetLookup::Failed(ErrorRecord::new(
            resource_url,
            "GET",
            source_id,
            None,
            response.as_ref().ok().map(ApiResponse::status_code),
            "lookup returned a non-object item",
        )),
        None => {
            debug!(resource = %resource_url, query = %lookup_url, "No matching item on target");
            TargetLookup::NotFound
        },
    }
}
