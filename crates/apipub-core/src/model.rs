//! Values that flow between pipeline stages.

use crate::document::Document;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

// ============================================================================
// Stages
// ============================================================================

/// The three publishing stages, run strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PublishingStage {
    KeyChanges,
    Upserts,
    Deletes,
}

impl PublishingStage {
    pub const ALL: [PublishingStage; 3] = [
        PublishingStage::KeyChanges,
        PublishingStage::Upserts,
        PublishingStage::Deletes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PublishingStage::KeyChanges => "key-changes",
            PublishingStage::Upserts => "upserts",
            PublishingStage::Deletes => "deletes",
        }
    }

    /// Source endpoint streamed for a resource in this stage.
    pub fn source_endpoint(&self, resource_url: &str) -> String {
        match self {
            PublishingStage::KeyChanges => format!("{}/keyChanges", resource_url),
            PublishingStage::Upserts => resource_url.to_string(),
            PublishingStage::Deletes => format!("{}/deletes", resource_url),
        }
    }
}

impl std::fmt::Display for PublishingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Paging
// ============================================================================

/// Window of change versions selecting only items modified within a span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeWindow {
    pub min_change_version: Option<i64>,
    pub max_change_version: Option<i64>,
}

impl ChangeWindow {
    pub fn new(min_change_version: Option<i64>, max_change_version: Option<i64>) -> Self {
        Self {
            min_change_version,
            max_change_version,
        }
    }

    /// Both bounds absent means no windowing.
    pub fn is_empty(&self) -> bool {
        self.min_change_version.is_none() && self.max_change_version.is_none()
    }

    pub fn is_valid(&self) -> bool {
        match (self.min_change_version, self.max_change_version) {
            (Some(min), Some(max)) => min <= max,
            _ => true,
        }
    }

    /// Query parameters for this window, without a leading separator.
    pub fn query_parameters(&self) -> Vec<String> {
        let mut params = Vec::new();
        if let Some(min) = self.min_change_version {
            params.push(format!("minChangeVersion={}", min));
        }
        if let Some(max) = self.max_change_version {
            params.push(format!("maxChangeVersion={}", max));
        }
        params
    }
}

/// One page of a resource to fetch from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub resource_url: String,
    pub offset: u64,
    pub limit: u64,
    pub change_window: Option<ChangeWindow>,
    pub is_final_page: bool,
}

impl PageRequest {
    /// Path and query for this page starting at `offset`.
    pub fn path_and_query(&self, offset: u64) -> String {
        let mut params = vec![format!("offset={}", offset), format!("limit={}", self.limit)];
        if let Some(window) = &self.change_window {
            params.extend(window.query_parameters());
        }
        format!("{}?{}", self.resource_url, params.join("&"))
    }
}

// ============================================================================
// Action messages
// ============================================================================

/// Items held back after a 403 until their prerequisite associations exist.
#[derive(Debug, Clone, Default)]
pub struct RetryQueue {
    items: Arc<Mutex<Vec<Document>>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: Document) {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(item);
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every queued item, leaving the queue empty.
    pub fn drain(&self) -> Vec<Document> {
        std::mem::take(
            &mut *self
                .items
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

/// Continuation that defers an upsert to the resource's retry node.
#[derive(Debug, Clone)]
pub struct AuthorizationRetry {
    queue: RetryQueue,
    id: String,
}

impl AuthorizationRetry {
    pub fn new(queue: RetryQueue, id: impl Into<String>) -> Self {
        Self {
            queue,
            id: id.into(),
        }
    }

    /// Re-queue the item with its source `id` restored.
    pub fn defer(self, mut item: Document) {
        if !self.id.is_empty() {
            item.insert("id".to_string(), serde_json::Value::String(self.id));
        }
        self.queue.push(item);
    }
}

#[derive(Debug, Clone)]
pub struct UpsertMessage {
    pub resource_url: String,
    pub item: Document,
    pub authorization_retry: Option<AuthorizationRetry>,
}

#[derive(Debug, Clone)]
pub struct KeyChangeMessage {
    pub resource_url: String,
    pub source_id: String,
    pub old_key_values: Document,
    pub new_key_values: Document,
}

#[derive(Debug, Clone)]
pub struct DeleteMessage {
    pub resource_url: String,
    pub source_id: String,
    pub key_values: Document,
}

/// Work for exactly one action processor, produced from one source item.
#[derive(Debug, Clone)]
pub enum ActionMessage {
    Upsert(UpsertMessage),
    KeyChange(KeyChangeMessage),
    Delete(DeleteMessage),
}

impl ActionMessage {
    pub fn resource_url(&self) -> &str {
        match self {
            ActionMessage::Upsert(m) => &m.resource_url,
            ActionMessage::KeyChange(m) => &m.resource_url,
            ActionMessage::Delete(m) => &m.resource_url,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActionMessage::Upsert(_) => "upsert",
            ActionMessage::KeyChange(_) => "key-change",
            ActionMessage::Delete(_) => "delete",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// An unrecoverable per-item failure, published to the error sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub resource_url: String,
    pub method: String,
    pub id: String,
    pub body: Option<serde_json::Value>,
    /// `None` when no response was received at all.
    pub response_status: Option<u16>,
    pub response_content: String,
}

impl ErrorRecord {
    pub fn new(
        resource_url: impl Into<String>,
        method: impl Into<String>,
        id: impl Into<String>,
        body: Option<serde_json::Value>,
        response_status: Option<u16>,
        response_content: impl Into<String>,
    ) -> Self {
        Self {
            resource_url: resource_url.into(),
            method: method.into(),
            id: id.into(),
            body,
            response_status,
            response_content: response_content.into(),
        }
    }
}

/// What is known about an unresolved reference in a rejected POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependencyDetails {
    pub dependent_resource: String,
    pub reference_name: String,
    pub referenced_resource_name: String,
    pub source_item_url: String,
    pub dependency_resource_url: String,
}

// ============================================================================
// Completion signals
// ============================================================================

/// Marks a resource's processing as finished; fires when dropped.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: watch::Sender<bool>,
}

/// Awaits another resource's [`CompletionSignal`].
#[derive(Debug, Clone)]
pub struct CompletionWaiter {
    resource: String,
    rx: watch::Receiver<bool>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn waiter(&self, resource: impl Into<String>) -> CompletionWaiter {
        CompletionWaiter {
            resource: resource.into(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn complete(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.complete();
    }
}

impl CompletionWaiter {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Resolves once the resource completed (or its signal was dropped).
    pub async fn wait(mut self) {
        // A closed channel means the owning task is gone, which also counts.
        let _ = self.rx.wait_for(|done| *done).await;
    }
}
