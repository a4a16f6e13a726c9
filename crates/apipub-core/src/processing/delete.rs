//! Delete processor: find the target item by natural key, then DELETE it by id.

use super::{failure_record, find_by_key_values, unexpected_message, ActionProcessor, TargetLookup};
use crate::client::ApiClient;
use crate::document::item_id;
use crate::model::{ActionMessage, DeleteMessage, ErrorRecord, PublishingStage};
use crate::retry::RetrySettings;
use apipub_common::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct DeleteProcessor {
    target: Arc<ApiClient>,
    retry: RetrySettings,
    max_degree_of_parallelism: usize,
}

impl DeleteProcessor {
    pub fn new(target: Arc<ApiClient>, retry: RetrySettings, max_degree_of_parallelism: usize) -> Self {
        Self {
            target,
            retry,
            max_degree_of_parallelism: max_degree_of_parallelism.max(1),
        }
    }

    async fn delete_item(&self, message: DeleteMessage) -> Option<ErrorRecord> {
        let DeleteMessage {
            resource_url,
            source_id,
            key_values,
        } = message;

        let item = match find_by_key_values(
            &self.target,
            &self.retry,
            &resource_url,
            &key_values,
            &source_id,
        )
        .await
        {
            TargetLookup::Found(item) => item,
            TargetLookup::NotFound => return None,
            TargetLookup::Failed(record) => return Some(record),
        };

        let target_id = item_id(&item);
        let delete_url = format!("{}/{}", resource_url, target_id);
        let response = self
            .retry
            .send(|_| self.target.delete(&delete_url), true)
            .await;

        match &response {
            Ok(r) if r.is_success() => {
                trace!(resource = %resource_url, id = %target_id, "Item deleted");
                None
            },
            Ok(r) if r.status == StatusCode::NOT_FOUND => {
                debug!(resource = %resource_url, id = %target_id, "Item already gone from target");
                None
            },
            _ => Some(failure_record(&resource_url, "DELETE", &source_id, None, &response)),
        }
    }
}

#[async_trait]
impl ActionProcessor for DeleteProcessor {
    fn stage(&self) -> PublishingStage {
        PublishingStage::Deletes
    }

    fn max_degree_of_parallelism(&self) -> usize {
        self.max_degree_of_parallelism
    }

    async fn process(&self, message: ActionMessage) -> Result<Option<ErrorRecord>> {
        match message {
            ActionMessage::Delete(message) => Ok(self.delete_item(message).await),
            other => Err(unexpected_message(self.stage(), &other)),
        }
    }
}
