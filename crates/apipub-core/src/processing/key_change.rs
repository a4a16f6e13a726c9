//! Key-change processor
//!
//! Finds the target item by its old natural key, overlays the new key values,
//! and PUTs it back under its target id.

use super::{failure_record, find_by_key_values, unexpected_message, ActionProcessor, TargetLookup};
use crate::client::ApiClient;
use crate::document::{apply_key_values, item_id, strip_fields, strip_reference_links};
use crate::model::{ActionMessage, ErrorRecord, KeyChangeMessage, PublishingStage};
use crate::retry::RetrySettings;
use apipub_common::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct KeyChangeProcessor {
    target: Arc<ApiClient>,
    retry: RetrySettings,
    max_degree_of_parallelism: usize,
}

impl KeyChangeProcessor {
    pub fn new(target: Arc<ApiClient>, retry: RetrySettings, max_degree_of_parallelism: usize) -> Self {
        Self {
            target,
            retry,
            max_degree_of_parallelism: max_degree_of_parallelism.max(1),
        }
    }

    async fn change_key(&self, message: KeyChangeMessage) -> Option<ErrorRecord> {
        let KeyChangeMessage {
            resource_url,
            source_id,
            old_key_values,
            new_key_values,
        } = message;

        let mut item = match find_by_key_values(
            &self.target,
            &self.retry,
            &resource_url,
            &old_key_values,
            &source_id,
        )
        .await
        {
            TargetLookup::Found(item) => item,
            TargetLookup::NotFound => return None,
            TargetLookup::Failed(record) => return Some(record),
        };

        let target_id = item_id(&item);
        strip_fields(&mut item, &["id", "_etag"]);
        strip_reference_links(&mut item);
        let applied = apply_key_values(&mut item, &new_key_values);
        debug!(resource = %resource_url, id = %target_id, applied, "Applying key change");

        let put_url = format!("{}/{}", resource_url, target_id);
        let response = self
            .retry
            .send(|_| self.target.put(&put_url, &item), true)
            .await;

        match &response {
            Ok(r) if r.is_success() => {
                trace!(resource = %resource_url, id = %target_id, "Key change applied");
                None
            },
            _ => Some(failure_record(
                &resource_url,
                "PUT",
                &source_id,
                Some(Value::Object(item)),
                &response,
            )),
        }
    }
}

#[async_trait]
impl ActionProcessor for KeyChangeProcessor {
    fn stage(&self) -> PublishingStage {
        PublishingStage::KeyChanges
    }

    fn max_degree_of_parallelism(&self) -> usize {
        self.max_degree_of_parallelism
    }

    async fn process(&self, message: ActionMessage) -> Result<Option<ErrorRecord>> {
        match message {
            ActionMessage::KeyChange(message) => Ok(self.change_key(message).await),
            other => Err(unexpected_message(self.stage(), &other)),
        }
    }
}
