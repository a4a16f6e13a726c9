//! Upsert processor
//!
//! POSTs source items to the target. Besides the shared retry shape it knows
//! how to:
//!
//! - treat a 409 on a descriptor as "already exists"
//! - defer a 403 to the resource's retry node, or ignore the resource for the
//!   rest of the run when forbidden POSTs are configured as warnings
//! - publish an unresolved reference from the source before retrying a 400
//! - ask a [`Remediator`] for a modified body and side requests
//!
//! The ignored-resource and unremediated sets live in [`UpsertRunState`] and
//! are shared by every upsert processor of a run.

use super::{failure_record, unexpected_message, ActionProcessor, ConcurrentSet};
use crate::client::{ApiClient, ApiResponse};
use crate::config::AuthorizationFailureHandling;
use crate::document::{
    descriptor_id_field, into_document, is_descriptor, item_id, last_segment,
    reference_link_href, reference_property_name, strip_fields, Document, SERVER_ASSIGNED_FIELDS,
};
use crate::model::{ActionMessage, ErrorRecord, MissingDependencyDetails, PublishingStage, UpsertMessage};
use crate::remediation::{remediation_key, FailureContext, RemediationRequest, Remediator};
use crate::retry::RetrySettings;
use apipub_common::{PublisherError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

const BAD_REQUEST: u16 = 400;
const FORBIDDEN: u16 = 403;
const CONFLICT: u16 = 409;

/// Nested dependency posts allowed below the original item.
const MAX_DEPENDENCY_DEPTH: u32 = 3;

const MISSING_REFERENCE_PATTERN: &str = r"(?P<reference>\w+) reference could not be resolved";

/// Per-run sets shared by all upsert processors.
#[derive(Debug, Default)]
pub struct UpsertRunState {
    /// Resources whose POSTs are forbidden and treated as warnings
    pub ignored_resources: ConcurrentSet,
    /// `{resourceUrl}/{statusCode}` keys with no remediation available
    pub unremediated: ConcurrentSet,
}

/// Final outcome of one (possibly retried) POST.
struct PostAttempt {
    response: Result<ApiResponse>,
    request_body: Document,
    retry: bool,
}

pub struct UpsertProcessor {
    source: Arc<ApiClient>,
    target: Arc<ApiClient>,
    retry: RetrySettings,
    state: Arc<UpsertRunState>,
    remediator: Option<Arc<dyn Remediator>>,
    primary_relationships: HashMap<String, Vec<String>>,
    treat_forbidden_post_as_warning: bool,
    max_degree_of_parallelism: usize,
    missing_reference: Regex,
}

impl UpsertProcessor {
    pub fn new(
        source: Arc<ApiClient>,
        target: Arc<ApiClient>,
        retry: RetrySettings,
        state: Arc<UpsertRunState>,
        max_degree_of_parallelism: usize,
    ) -> Result<Self> {
        let missing_reference = Regex::new(MISSING_REFERENCE_PATTERN)
            .map_err(|e| PublisherError::config(format!("invalid reference pattern: {}", e)))?;

        Ok(Self {
            source,
            target,
            retry,
            state,
            remediator: None,
            primary_relationships: HashMap::new(),
            treat_forbidden_post_as_warning: false,
            max_degree_of_parallelism: max_degree_of_parallelism.max(1),
            missing_reference,
        })
    }

    pub fn with_remediator(mut self, remediator: Arc<dyn Remediator>) -> Self {
        self.remediator = Some(remediator);
        self
    }

    /// Resources whose unresolved references may be published on demand.
    pub fn with_primary_relationships(mut self, handling: &[AuthorizationFailureHandling]) -> Self {
        self.primary_relationships = handling
            .iter()
            .map(|h| (h.path.clone(), h.update_prerequisite_paths.clone()))
            .collect();
        self
    }

    pub fn treat_forbidden_post_as_warning(mut self, enabled: bool) -> Self {
        self.treat_forbidden_post_as_warning = enabled;
        self
    }

    async fn post_item(&self, message: UpsertMessage) -> Option<ErrorRecord> {
        let UpsertMessage {
            resource_url,
            mut item,
            authorization_retry,
        } = message;

        if self.state.ignored_resources.contains(&resource_url) {
            trace!(resource = %resource_url, "Resource is ignored for this run");
            return None;
        }

        let id = item_id(&item);
        strip_fields(&mut item, &SERVER_ASSIGNED_FIELDS);
        if let Some(field) = descriptor_id_field(&resource_url) {
            strip_fields(&mut item, &[field.as_str()]);
        }

        let PostAttempt {
            response,
            request_body,
            ..
        } = self.post_with_retry(&resource_url, &item, 0).await;

        let status = match &response {
            Ok(r) if r.is_success() => {
                trace!(resource = %resource_url, id = %id, "Item published");
                return None;
            },
            Ok(r) => r.status_code(),
            Err(_) => {
                return Some(failure_record(
                    &resource_url,
                    "POST",
                    &id,
                    Some(Value::Object(request_body)),
                    &response,
                ));
            },
        };

        if status == CONFLICT && is_descriptor(&resource_url) {
            debug!(resource = %resource_url, id = %id, "Descriptor already exists on target");
            return None;
        }

        if status == FORBIDDEN {
            if let Some(retry) = authorization_retry {
                debug!(resource = %resource_url, id = %id, "POST forbidden; deferring to retry node");
                retry.defer(item);
                return None;
            }
            if self.treat_forbidden_post_as_warning {
                if self.state.ignored_resources.insert(resource_url.clone()) {
                    warn!(
                        resource = %resource_url,
                        "POST forbidden; skipping remaining items of this resource"
                    );
                }
                return None;
            }
        }

        Some(failure_record(
            &resource_url,
            "POST",
            &id,
            Some(Value::Object(request_body)),
            &response,
        ))
    }

    /// POST under the retry policy. Boxed because dependency resolution recurses.
    fn post_with_retry<'a>(
        &'a self,
        resource_url: &'a str,
        body: &'a Document,
        depth: u32,
    ) -> BoxFuture<'a, PostAttempt> {
        Box::pin(async move {
            let replacement = Mutex::new(None);
            let replacement = &replacement;

            self.retry
                .policy
                .execute(
                    move |attempt| self.attempt_post(resource_url, body, replacement, attempt, depth),
                    |outcome: &PostAttempt| outcome.retry,
                )
                .await
        })
    }

    async fn attempt_post(
        &self,
        resource_url: &str,
        body: &Document,
        replacement: &Mutex<Option<Document>>,
        attempt: u32,
        depth: u32,
    ) -> PostAttempt {
        let request_body = take_replacement(replacement).unwrap_or_else(|| body.clone());
        let response = self.target.post(resource_url, &request_body).await;

        let retry = match &response {
            Err(e) => {
                warn!(resource = %resource_url, attempt, error = %e, "POST failed");
                true
            },
            Ok(r) if r.is_success() => false,
            Ok(r) => {
                self.should_retry_failure(resource_url, &request_body, r, replacement, attempt, depth)
                    .await
            },
        };

        PostAttempt {
            response,
            request_body,
            retry,
        }
    }

    /// Classify a non-success response, running side effects when another
    /// attempt will follow.
    async fn should_retry_failure(
        &self,
        resource_url: &str,
        request_body: &Document,
        response: &ApiResponse,
        replacement: &Mutex<Option<Document>>,
        attempt: u32,
        depth: u32,
    ) -> bool {
        let status = response.status_code();
        match status {
            CONFLICT if is_descriptor(resource_url) => return false,
            FORBIDDEN => return false,
            _ => {},
        }

        if self.retry.is_transient(status) || status == CONFLICT {
            debug!(resource = %resource_url, attempt, status, "Retryable POST response");
            return true;
        }

        let can_retry = self.retry.policy.can_retry_after(attempt);

        if status == BAD_REQUEST {
            if let Some(prerequisites) = self.primary_relationships.get(resource_url) {
                if let Some(reference) = self.missing_reference_name(&response.error_message()) {
                    if can_retry {
                        self.resolve_missing_dependency(
                            resource_url,
                            request_body,
                            &reference,
                            prerequisites,
                            depth,
                        )
                        .await;
                    }
                    return true;
                }
            }
        }

        match &self.remediator {
            Some(remediator) if can_retry => {
                self.remediate(remediator.as_ref(), resource_url, request_body, response, replacement)
                    .await
            },
            _ => false,
        }
    }

    fn missing_reference_name(&self, message: &str) -> Option<String> {
        self.missing_reference
            .captures(message)
            .and_then(|captures| captures.name("reference"))
            .map(|m| m.as_str().to_string())
    }

    // ========================================================================
    // Missing dependencies
    // ========================================================================

    async fn resolve_missing_dependency(
        &self,
        resource_url: &str,
        request_body: &Document,
        reference: &str,
        prerequisites: &[String],
        depth: u32,
    ) {
        if depth >= MAX_DEPENDENCY_DEPTH {
            warn!(resource = %resource_url, reference, depth, "Dependency chain too deep; not resolving");
            return;
        }

        let Some(details) =
            missing_dependency_details(resource_url, request_body, reference, prerequisites)
        else {
            warn!(
                resource = %resource_url,
                reference,
                "Unresolved reference has no source link or matching prerequisite"
            );
            return;
        };

        info!(
            resource = %details.dependent_resource,
            reference = %details.reference_name,
            dependency = %details.dependency_resource_url,
            item = %details.source_item_url,
            "Publishing missing dependency"
        );

        let Some(mut dependency) = self.fetch_source_item(&details.source_item_url).await else {
            return;
        };
        strip_fields(&mut dependency, &SERVER_ASSIGNED_FIELDS);

        let attempt = self
            .post_with_retry(&details.dependency_resource_url, &dependency, depth + 1)
            .await;

        match &attempt.response {
            Ok(r) if r.is_success() => {
                debug!(dependency = %details.dependency_resource_url, "Missing dependency published");
            },
            Ok(r) => warn!(
                dependency = %details.dependency_resource_url,
                status = r.status_code(),
                response = %r.body,
                "Failed to publish missing dependency"
            ),
            Err(e) => warn!(
                dependency = %details.dependency_resource_url,
                error = %e,
                "Failed to publish missing dependency"
            ),
        }
    }

    async fn fetch_source_item(&self, url: &str) -> Option<Document> {
        let response = self.retry.send(|_| self.source.get(url), false).await;

        let body = match response {
            Ok(r) if r.is_success() => r.body,
            Ok(r) => {
                warn!(item = %url, status = r.status_code(), "Failed to fetch dependency from source");
                return None;
            },
            Err(e) => {
                warn!(item = %url, error = %e, "Failed to fetch dependency from source");
                return None;
            },
        };

        match serde_json::from_str::<Value>(&body)
            .map_err(PublisherError::from)
            .and_then(into_document)
        {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(item = %url, error = %e, "Dependency item is not a JSON object");
                None
            },
        }
    }

    // ========================================================================
    // Remediation
    // ========================================================================

    async fn remediate(
        &self,
        remediator: &dyn Remediator,
        resource_url: &str,
        request_body: &Document,
        response: &ApiResponse,
        replacement: &Mutex<Option<Document>>,
    ) -> bool {
        let key = remediation_key(resource_url, response.status_code());
        if self.state.unremediated.contains(&key) {
            return false;
        }

        let context = FailureContext {
            resource_url: resource_url.to_string(),
            request_body: Value::Object(request_body.clone()),
            response_status: response.status_code(),
            response_body: response.body.clone(),
            source_connection_name: self.source.name().to_string(),
            target_connection_name: self.target.name().to_string(),
        };

        match remediator.remediate(&key, &context).await {
            Ok(None) => {
                debug!(key = %key, "No remediation available");
                self.state.unremediated.insert(key);
                false
            },
            Ok(Some(plan)) => {
                info!(
                    key = %key,
                    modified_body = plan.modified_request_body.is_some(),
                    additional_requests = plan.additional_requests.len(),
                    "Applying remediation"
                );
                if let Some(body) = plan.modified_request_body {
                    store_replacement(replacement, body);
                }
                for request in plan.additional_requests {
                    self.post_remediation_request(request).await;
                }
                true
            },
            Err(e) => {
                let e = remediation_failure(&key, e);
                warn!(key = %key, error = %e, "Remediation skipped");
                self.state.unremediated.insert(key);
                false
            },
        }
    }

    async fn post_remediation_request(&self, request: RemediationRequest) {
        match self.target.post(&request.resource, &request.body).await {
            Ok(r) if r.is_success() => {
                debug!(resource = %request.resource, status = r.status_code(), "Remediation request succeeded");
            },
            Ok(r) => warn!(
                resource = %request.resource,
                status = r.status_code(),
                response = %r.body,
                "Remediation request failed"
            ),
            Err(e) => warn!(resource = %request.resource, error = %e, "Remediation request failed"),
        }
    }
}

#[async_trait]
impl ActionProcessor for UpsertProcessor {
    fn stage(&self) -> PublishingStage {
        PublishingStage::Upserts
    }

    fn max_degree_of_parallelism(&self) -> usize {
        self.max_degree_of_parallelism
    }

    async fn process(&self, message: ActionMessage) -> Result<Option<ErrorRecord>> {
        match message {
            ActionMessage::Upsert(message) => Ok(self.post_item(message).await),
            other => Err(unexpected_message(self.stage(), &other)),
        }
    }
}

fn take_replacement(replacement: &Mutex<Option<Document>>) -> Option<Document> {
    replacement
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

fn store_replacement(replacement: &Mutex<Option<Document>>, body: Document) {
    *replacement
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(body);
}

/// Locate the source item and target resource for an unresolved reference.
///
/// The prerequisite is chosen case-insensitively: first the one whose last
/// segment is the reference name pluralised, then one whose last segment
/// starts with the name, then the only prerequisite.
pub(crate) fn missing_dependency_details(
    resource_url: &str,
    request_body: &Document,
    reference: &str,
    prerequisites: &[String],
) -> Option<MissingDependencyDetails> {
    let property = reference_property_name(reference);
    let source_item_url = reference_link_href(request_body, &property)?.to_string();

    let wanted = reference.to_lowercase();
    let segment = |p: &String| last_segment(p).to_lowercase();
    let dependency_resource_url = prerequisites
        .iter()
        .find(|p| names_resource(&segment(*p), &wanted))
        .or_else(|| prerequisites.iter().find(|p| segment(*p).starts_with(&wanted)))
        .or_else(|| prerequisites.first().filter(|_| prerequisites.len() == 1))?
        .clone();

    Some(MissingDependencyDetails {
        dependent_resource: resource_url.to_string(),
        reference_name: property,
        referenced_resource_name: reference.to_string(),
        source_item_url,
        dependency_resource_url,
    })
}

fn remediation_failure(key: &str, error: PublisherError) -> PublisherError {
    match error {
        PublisherError::Remediation { .. } => error,
        other => PublisherError::remediation(key, other.to_string()),
    }
}

/// `staffs` and `staff` both name the `staff` resource.
fn names_resource(segment: &str, reference: &str) -> bool {
    segment == reference
        || segment.strip_suffix('s') == Some(reference)
        || segment.strip_suffix("es") == Some(reference)
}
