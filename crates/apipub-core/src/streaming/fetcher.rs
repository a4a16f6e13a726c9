//! Page fetcher
//!
//! GETs one page from the source and converts each item into an action
//! message. A full final page is followed by further fetches at the next
//! offset, since the source may have grown while the resource was streaming.

use super::producers::ActionMessageProducer;
use crate::client::ApiClient;
use crate::error_publishing::ErrorPublisher;
use crate::model::{ActionMessage, ErrorRecord, PageRequest};
use crate::retry::RetrySettings;
use apipub_common::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct PageFetcher {
    source: Arc<ApiClient>,
    retry: RetrySettings,
}

impl PageFetcher {
    pub fn new(source: Arc<ApiClient>, retry: RetrySettings) -> Self {
        Self { source, retry }
    }

    /// Fetch a page and send its messages downstream.
    ///
    /// Returns the number of messages sent. Only a producer failure is
    /// returned as an error; request and parse failures end the page.
    pub async fn fetch(
        &self,
        page: PageRequest,
        producer: &dyn ActionMessageProducer,
        cancellation: &CancellationToken,
        messages: &mpsc::Sender<ActionMessage>,
        errors: &ErrorPublisher,
    ) -> Result<usize> {
        let mut offset = page.offset;
        let mut sent = 0;

        loop {
            if cancellation.is_cancelled() {
                return Ok(sent);
            }

            let Some(items) = self.get_items(&page, offset, errors).await else {
                return Ok(sent);
            };
            let returned = items.len() as u64;

            for item in items {
                if cancellation.is_cancelled() {
                    debug!(resource = %page.resource_url, offset, "Cancelled while producing messages");
                    return Ok(sent);
                }

                let Some(message) = producer.produce(item, cancellation)? else {
                    continue;
                };
                if messages.send(message).await.is_err() {
                    debug!(resource = %page.resource_url, "Message channel closed");
                    return Ok(sent);
                }
                sent += 1;
            }

            if !page.is_final_page || returned < page.limit {
                return Ok(sent);
            }

            offset += page.limit;
            debug!(
                resource = %page.resource_url,
                offset,
                "Final page was full; fetching the next page"
            );
        }
    }

    async fn get_items(
        &self,
        page: &PageRequest,
        offset: u64,
        errors: &ErrorPublisher,
    ) -> Option<Vec<Value>> {
        let url = page.path_and_query(offset);
        let response = self.retry.send(|_| self.source.get(&url), false).await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                errors
                    .publish(ErrorRecord::new(&url, "GET", "", None, None, e.to_string()))
                    .await;
                return None;
            },
        };

        if !response.is_success() {
            errors
                .publish(ErrorRecord::new(
                    &url,
                    "GET",
                    "",
                    None,
                    Some(response.status_code()),
                    response.body,
                ))
                .await;
            return None;
        }

        match serde_json::from_str::<Vec<Value>>(&response.body) {
            Ok(items) => Some(items),
            Err(e) => {
                error!(resource = %url, error = %e, "Page response is not a JSON array; skipping page");
                None
            },
        }
    }
}
