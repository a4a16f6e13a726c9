//! Remediation of failed writes
//!
//! A remediator is looked up by `{resourceUrl}/{statusCode}` and, given the
//! failure, may return a replacement request body for the next attempt and
//! side requests to POST first. "Not found" means the failure is permanent.

use crate::document::Document;
use apipub_common::{PublisherError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Lookup key for a failed write.
pub fn remediation_key(resource_url: &str, status: u16) -> String {
    format!("{}/{}", resource_url, status)
}

/// What the remediator sees about a failed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    pub resource_url: String,
    pub request_body: serde_json::Value,
    pub response_status: u16,
    pub response_body: String,
    pub source_connection_name: String,
    pub target_connection_name: String,
}

/// A side request issued as part of a remediation (always a POST).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequest {
    pub resource: String,
    pub body: Document,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationPlan {
    #[serde(default)]
    pub modified_request_body: Option<Document>,
    #[serde(default)]
    pub additional_requests: Vec<RemediationRequest>,
}

#[async_trait]
pub trait Remediator: Send + Sync {
    /// `Ok(None)` when no remediation exists for `key`.
    async fn remediate(&self, key: &str, context: &FailureContext) -> Result<Option<RemediationPlan>>;
}

/// Fixed plans keyed by `{resourceUrl}/{statusCode}`.
#[derive(Debug, Clone, Default)]
pub struct StaticRemediator {
    plans: HashMap<String, RemediationPlan>,
}

impl StaticRemediator {
    pub fn new(plans: HashMap<String, RemediationPlan>) -> Self {
        Self { plans }
    }

    /// Parse `{ "<resource>/<status>": { modifiedRequestBody?, additionalRequests? } }`
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(Self::new(serde_json::from_str(text)?))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(|e| {
            PublisherError::config(format!("invalid remediation file {}: {}", path.display(), e))
        })
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

#[async_trait]
impl Remediator for StaticRemediator {
    async fn remediate(&self, key: &str, _context: &FailureContext) -> Result<Option<RemediationPlan>> {
        Ok(self.plans.get(key).cloned())
    }
}
