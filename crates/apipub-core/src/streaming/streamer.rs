//! Paged resource streamer
//!
//! Waits for the resource's dependency gates, takes a permit from the global
//! streaming semaphore, asks the source for the item count, and emits one
//! [`PageRequest`] per page into a bounded channel.

use crate::client::{ApiClient, TOTAL_COUNT_HEADER};
use crate::document::is_descriptor;
use crate::error_publishing::ErrorPublisher;
use crate::model::{ChangeWindow, CompletionWaiter, ErrorRecord, PageRequest};
use crate::retry::RetrySettings;
use apipub_common::{PublisherError, Result};
use reqwest::StatusCode;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything needed to stream one resource in one stage.
#[derive(Debug, Clone)]
pub struct ResourceStreamRequest {
    /// Resource being published, e.g. `/ed-fi/students`
    pub resource_url: String,
    /// Source endpoint to page through, e.g. `/ed-fi/students/deletes`
    pub endpoint: String,
    pub page_size: u64,
    pub change_window: Option<ChangeWindow>,
    pub dependencies: Vec<CompletionWaiter>,
    pub cancellation: CancellationToken,
    pub concurrency_limit: Arc<Semaphore>,
}

/// Lazily enumerate the pages covering `[0, total_count)`.
pub fn page_requests(
    endpoint: &str,
    total_count: u64,
    page_size: u64,
    change_window: Option<ChangeWindow>,
) -> impl Iterator<Item = PageRequest> + '_ {
    let page_size = page_size.max(1);
    let pages = total_count.div_ceil(page_size);

    (0..pages).map(move |page| PageRequest {
        resource_url: endpoint.to_string(),
        offset: page * page_size,
        limit: page_size,
        change_window,
        is_final_page: page + 1 == pages,
    })
}

/// Wait for every dependency to complete.
pub async fn wait_for_dependencies(resource_url: &str, dependencies: Vec<CompletionWaiter>) {
    for waiter in dependencies {
        debug!(resource = %resource_url, dependency = %waiter.resource(), "Waiting for dependency");
        waiter.wait().await;
    }
}

#[derive(Debug, Clone)]
pub struct PagedResourceStreamer {
    source: Arc<ApiClient>,
    retry: RetrySettings,
}

impl PagedResourceStreamer {
    pub fn new(source: Arc<ApiClient>, retry: RetrySettings) -> Self {
        Self { source, retry }
    }

    /// Stream page requests for one resource; returns the number of pages sent.
    ///
    /// Count failures are published as error records and yield zero pages.
    /// A closed page channel ends streaming quietly.
    pub async fn stream(
        &self,
        request: ResourceStreamRequest,
        pages: mpsc::Sender<PageRequest>,
        errors: &ErrorPublisher,
    ) -> Result<u64> {
        let ResourceStreamRequest {
            resource_url,
            endpoint,
            page_size,
            change_window,
            dependencies,
            cancellation,
            concurrency_limit,
        } = request;

        wait_for_dependencies(&resource_url, dependencies).await;
        if cancellation.is_cancelled() {
            debug!(resource = %resource_url, "Cancelled before streaming");
            return Ok(0);
        }

        let _permit = concurrency_limit.acquire().await.map_err(|e| {
            PublisherError::pipeline("streaming", format!("concurrency limit closed: {}", e))
        })?;

        let Some(total_count) = self
            .total_count(&resource_url, &endpoint, change_window.as_ref(), errors)
            .await
        else {
            return Ok(0);
        };

        info!(resource = %endpoint, total_count, page_size, "Streaming resource");

        let mut sent = 0;
        for page in page_requests(&endpoint, total_count, page_size, change_window) {
            if cancellation.is_cancelled() {
                debug!(resource = %resource_url, sent, "Cancelled while streaming pages");
                break;
            }
            if pages.send(page).await.is_err() {
                debug!(resource = %resource_url, "Page channel closed");
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Count query; `None` means the resource yields no pages.
    async fn total_count(
        &self,
        resource_url: &str,
        endpoint: &str,
        change_window: Option<&ChangeWindow>,
        errors: &ErrorPublisher,
    ) -> Option<u64> {
        let mut query = vec!["limit=1".to_string(), "totalCount=true".to_string()];
        if let Some(window) = change_window {
            query.extend(window.query_parameters());
        }
        let count_url = format!("{}?{}", endpoint, query.join("&"));

        let response = self
            .retry
            .send(|_| self.source.get(&count_url), false)
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                errors
                    .publish(ErrorRecord::new(endpoint, "GET", "", None, None, e.to_string()))
                    .await;
                return None;
            },
        };

        if response.status == StatusCode::FORBIDDEN && is_descriptor(resource_url) {
            info!(resource = %resource_url, "Descriptor is not accessible from the source; skipping");
            return None;
        }

        if !response.is_success() {
            errors
                .publish(ErrorRecord::new(
                    endpoint,
                    "GET",
                    "",
                    None,
                    Some(response.status_code()),
                    response.body,
                ))
                .await;
            return None;
        }

        match response.total_count {
            Some(0) => {
                debug!(resource = %endpoint, "No items to stream");
                None
            },
            Some(count) => Some(count),
            None => {
                errors
                    .publish(ErrorRecord::new(
                        endpoint,
                        "GET",
                        "",
                        None,
                        Some(response.status_code()),
                        format!("response did not include a {} header", TOTAL_COUNT_HEADER),
                    ))
                    .await;
                None
            },
        }
    }
}
