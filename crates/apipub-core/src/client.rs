//! HTTP client for the source and target resource APIs
//!
//! Thin wrapper over `reqwest` that resolves resource paths against a base
//! URL and buffers responses so that callers can inspect status, the
//! `Total-Count` header, and the body without holding the connection.

use crate::config::ConnectionConfig;
use crate::document::Document;
use apipub_common::Result;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::trace;

/// Header carrying the item count on `totalCount=true` queries.
pub const TOTAL_COUNT_HEADER: &str = "Total-Count";

/// A fully-read response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub total_count: Option<u64>,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// The `message` of an error payload, or the raw body when it has none.
    pub fn error_message(&self) -> String {
        serde_json::from_str::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| self.body.clone())
    }
}

/// Client for one API connection.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    name: String,
    base_url: String,
    access_token: Option<String>,
}

impl ApiClient {
    /// Create a client for the given connection
    pub fn new(connection: &ConnectionConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            name: connection.name.clone(),
            base_url: connection.url.trim_end_matches('/').to_string(),
            access_token: connection.access_token.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a resource path (or an absolute URL) against the base URL.
    pub fn url(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with("http://") || path_and_query.starts_with("https://") {
            return path_and_query.to_string();
        }
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }

    pub async fn get(&self, path_and_query: &str) -> Result<ApiResponse> {
        self.send(self.client.get(self.url(path_and_query))).await
    }

    pub async fn post(&self, path: &str, body: &Document) -> Result<ApiResponse> {
        self.send(self.client.post(self.url(path)).json(body)).await
    }

    pub async fn put(&self, path: &str, body: &Document) -> Result<ApiResponse> {
        self.send(self.client.put(self.url(path)).json(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send(self.client.delete(self.url(path))).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<ApiResponse> {
        let request = match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        let total_count = response
            .headers()
            .get(TOTAL_COUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let body = response.text().await?;

        trace!(connection = %self.name, status = status.as_u16(), "Received response");

        Ok(ApiResponse {
            status,
            total_count,
            body,
        })
    }
}
