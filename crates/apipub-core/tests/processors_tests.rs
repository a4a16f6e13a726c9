//! Upsert, key-change and delete processors against mock source and target APIs
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use apipub_common::Result;
use apipub_core::config::AuthorizationFailureHandling;
use apipub_core::model::{
    ActionMessage, AuthorizationRetry, DeleteMessage, KeyChangeMessage, RetryQueue, UpsertMessage,
};
use apipub_core::processing::{
    ActionProcessor, DeleteProcessor, KeyChangeProcessor, UpsertProcessor, UpsertRunState,
};
use apipub_core::remediation::{
    FailureContext, RemediationPlan, RemediationRequest, Remediator, StaticRemediator,
};
use async_trait::async_trait;
use common::{client, doc, retry};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn upsert(resource: &str, item: serde_json::Value) -> ActionMessage {
    ActionMessage::Upsert(UpsertMessage {
        resource_url: resource.to_string(),
        item: doc(item),
        authorization_retry: None,
    })
}

fn upsert_processor(source: &MockServer, target: &MockServer, max_attempts: u32) -> UpsertProcessor {
    UpsertProcessor::new(
        client("Source", source),
        client("Target", target),
        retry(max_attempts),
        Arc::new(UpsertRunState::default()),
        4,
    )
    .unwrap()
}

// ============================================================================
// Upserts
// ============================================================================

#[tokio::test]
async fn test_upsert_strips_server_assigned_fields() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/schools"))
        .and(body_json(json!({"schoolId": 255901, "nameOfInstitution": "Grand Bend High School"})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&target)
        .await;

    let processor = upsert_processor(&source, &target, 3);
    let result = processor
        .process(upsert(
            "/ed-fi/schools",
            json!({
                "id": "a1",
                "_etag": "5250168731208835",
                "_lastModifiedDate": "2024-01-01T00:00:00Z",
                "schoolId": 255901,
                "nameOfInstitution": "Grand Bend High School"
            }),
        ))
        .await
        .unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_existing_descriptor_is_not_an_error() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/gradeLevelDescriptors"))
        .and(body_json(json!({"codeValue": "Ninth grade", "namespace": "uri://ed-fi.org/GradeLevelDescriptor"})))
        .respond_with(ResponseTemplate::new(409))
        .expect(1)
        .mount(&target)
        .await;

    let processor = upsert_processor(&source, &target, 3);
    let result = processor
        .process(upsert(
            "/ed-fi/gradeLevelDescriptors",
            json!({
                "id": "d1",
                "gradeLevelDescriptorId": 12,
                "codeValue": "Ninth grade",
                "namespace": "uri://ed-fi.org/GradeLevelDescriptor"
            }),
        ))
        .await
        .unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&target)
        .await;

    let processor = upsert_processor(&source, &target, 3);
    let result = processor
        .process(upsert("/ed-fi/students", json!({"studentUniqueId": "604822"})))
        .await
        .unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_persistent_transient_failure_is_reported_once() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(3)
        .mount(&target)
        .await;

    let processor = upsert_processor(&source, &target, 3);
    let record = processor
        .process(upsert("/ed-fi/students", json!({"id": "s1", "studentUniqueId": "604822"})))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.method, "POST");
    assert_eq!(record.id, "s1");
    assert_eq!(record.response_status, Some(503));
    assert_eq!(record.response_content, "unavailable");
    assert_eq!(record.body, Some(json!({"studentUniqueId": "604822"})));
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "bad"})))
        .expect(1)
        .mount(&target)
        .await;

    let processor = upsert_processor(&source, &target, 5);
    let record = processor
        .process(upsert("/ed-fi/students", json!({"studentUniqueId": "604822"})))
        .await
        .unwrap();

    assert_eq!(record.unwrap().response_status, Some(400));
}

#[tokio::test]
async fn test_forbidden_post_as_warning_ignores_resource() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/surveys"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&target)
        .await;

    let state = Arc::new(UpsertRunState::default());
    let processor = UpsertProcessor::new(
        client("Source", &source),
        client("Target", &target),
        retry(3),
        state.clone(),
        4,
    )
    .unwrap()
    .treat_forbidden_post_as_warning(true);

    for survey in ["s1", "s2", "s3"] {
        let result = processor
            .process(upsert("/ed-fi/surveys", json!({"surveyIdentifier": survey})))
            .await
            .unwrap();
        assert!(result.is_none());
    }
    assert!(state.ignored_resources.contains("/ed-fi/surveys"));
}

#[tokio::test]
async fn test_forbidden_post_is_an_error_by_default() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/surveys"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&target)
        .await;

    let processor = upsert_processor(&source, &target, 3);
    let record = processor
        .process(upsert("/ed-fi/surveys", json!({"surveyIdentifier": "s1"})))
        .await
        .unwrap();

    assert_eq!(record.unwrap().response_status, Some(403));
}

#[tokio::test]
async fn test_forbidden_post_defers_to_retry_queue() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&target)
        .await;

    let queue = RetryQueue::new();
    let processor = upsert_processor(&source, &target, 3);
    let result = processor
        .process(ActionMessage::Upsert(UpsertMessage {
            resource_url: "/ed-fi/students".to_string(),
            item: doc(json!({"id": "src-1", "_etag": "1", "studentUniqueId": "604822"})),
            authorization_retry: Some(AuthorizationRetry::new(queue.clone(), "src-1")),
        }))
        .await
        .unwrap();

    assert!(result.is_none());
    let deferred = queue.drain();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0]["id"], json!("src-1"));
    assert_eq!(deferred[0]["studentUniqueId"], json!("604822"));
    assert!(!deferred[0].contains_key("_etag"));
}

#[tokio::test]
async fn test_missing_dependency_is_published_from_source() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;

    let association = json!({
        "id": "assoc-1",
        "beginDate": "2024-08-20",
        "staffReference": {
            "staffUniqueId": "207219",
            "link": {"rel": "Staff", "href": "/ed-fi/staffs/f3b1"}
        }
    });

    Mock::given(method("GET"))
        .and(path("/ed-fi/staffs/f3b1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "f3b1",
            "_etag": "77",
            "staffUniqueId": "207219",
            "firstName": "Kathy"
        })))
        .expect(1)
        .mount(&source)
        .await;

    Mock::given(method("POST"))
        .and(path("/ed-fi/staffSectionAssociations"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "message": "Validation failed: Staff reference could not be resolved."
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/staffSectionAssociations"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/staffs"))
        .and(body_json(json!({"staffUniqueId": "207219", "firstName": "Kathy"})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&target)
        .await;

    let processor = upsert_processor(&source, &target, 3).with_primary_relationships(&[
        AuthorizationFailureHandling {
            path: "/ed-fi/staffSectionAssociations".to_string(),
            update_prerequisite_paths: vec![
                "/ed-fi/staffSchoolAssociations".to_string(),
                "/ed-fi/staffs".to_string(),
            ],
        },
    ]);

    let result = processor
        .process(upsert("/ed-fi/staffSectionAssociations", association))
        .await
        .unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_remediation_replaces_body_and_posts_side_requests() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .and(body_json(json!({"studentUniqueId": "604822"})))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .and(body_json(json!({"studentUniqueId": "604822", "firstName": "Unknown"})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/people"))
        .and(body_json(json!({"personId": "604822"})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&target)
        .await;

    let remediator = StaticRemediator::new(HashMap::from([(
        "/ed-fi/students/400".to_string(),
        RemediationPlan {
            modified_request_body: Some(doc(json!({"studentUniqueId": "604822", "firstName": "Unknown"}))),
            additional_requests: vec![RemediationRequest {
                resource: "/ed-fi/people".to_string(),
                body: doc(json!({"personId": "604822"})),
            }],
        },
    )]));

    let processor = upsert_processor(&source, &target, 3).with_remediator(Arc::new(remediator));
    let result = processor
        .process(upsert("/ed-fi/students", json!({"studentUniqueId": "604822"})))
        .await
        .unwrap();

    assert!(result.is_none());
}

/// Remediator that never has a plan, counting how often it is asked.
#[derive(Default)]
struct CountingRemediator {
    calls: AtomicUsize,
}

#[async_trait]
impl Remediator for CountingRemediator {
    async fn remediate(&self, _key: &str, _context: &FailureContext) -> Result<Option<RemediationPlan>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

#[tokio::test]
async fn test_unremediated_failure_is_asked_once_per_run() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(400))
        .expect(2)
        .mount(&target)
        .await;

    let remediator = Arc::new(CountingRemediator::default());
    let processor = upsert_processor(&source, &target, 3).with_remediator(remediator.clone());

    for id in ["1", "2"] {
        let record = processor
            .process(upsert("/ed-fi/students", json!({"studentUniqueId": id})))
            .await
            .unwrap();
        assert_eq!(record.unwrap().response_status, Some(400));
    }

    assert_eq!(remediator.calls.load(Ordering::SeqCst), 1);
}

/// Remediator whose lookup always fails.
#[derive(Default)]
struct FailingRemediator {
    calls: AtomicUsize,
}

#[async_trait]
impl Remediator for FailingRemediator {
    async fn remediate(&self, _key: &str, _context: &FailureContext) -> Result<Option<RemediationPlan>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(apipub_common::PublisherError::dependency("remediation script crashed"))
    }
}

#[tokio::test]
async fn test_failed_remediation_reports_original_failure() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad student"))
        .expect(2)
        .mount(&target)
        .await;

    let remediator = Arc::new(FailingRemediator::default());
    let processor = upsert_processor(&source, &target, 3).with_remediator(remediator.clone());

    for id in ["1", "2"] {
        let record = processor
            .process(upsert("/ed-fi/students", json!({"studentUniqueId": id})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.response_status, Some(400));
        assert_eq!(record.response_content, "bad student");
    }

    assert_eq!(remediator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_upsert_processor_rejects_other_messages() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;

    let processor = upsert_processor(&source, &target, 3);
    let result = processor
        .process(ActionMessage::Delete(DeleteMessage {
            resource_url: "/ed-fi/students".to_string(),
            source_id: "1".to_string(),
            key_values: doc(json!({"studentUniqueId": "1"})),
        }))
        .await;

    assert!(result.is_err());
}

// ============================================================================
// Key changes
// ============================================================================

fn key_change(old: serde_json::Value, new: serde_json::Value) -> ActionMessage {
    ActionMessage::KeyChange(KeyChangeMessage {
        resource_url: "/ed-fi/sessions".to_string(),
        source_id: "src-9".to_string(),
        old_key_values: doc(old),
        new_key_values: doc(new),
    })
}

#[tokio::test]
async fn test_key_change_without_target_match_is_skipped() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ed-fi/sessions"))
        .and(query_param("sessionName", "Fall 2024"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&target)
        .await;

    let processor = KeyChangeProcessor::new(client("Target", &target), retry(3), 2);
    let result = processor
        .process(key_change(json!({"sessionName": "Fall 2024"}), json!({"sessionName": "Autumn 2024"})))
        .await
        .unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_key_change_puts_item_with_new_keys() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ed-fi/sessions"))
        .and(query_param("sessionName", "Fall 2024"))
        .and(query_param("schoolId", "255901"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": "t-42",
            "_etag": "9",
            "sessionName": "Fall 2024",
            "totalInstructionalDays": 88,
            "schoolReference": {
                "schoolId": 255901,
                "link": {"rel": "School", "href": "/ed-fi/schools/x"}
            }
        }])))
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("PUT"))
        .and(path("/ed-fi/sessions/t-42"))
        .and(body_json(json!({
            "sessionName": "Autumn 2024",
            "totalInstructionalDays": 88,
            "schoolReference": {"schoolId": 255901}
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&target)
        .await;

    let processor = KeyChangeProcessor::new(client("Target", &target), retry(3), 2);
    let result = processor
        .process(key_change(
            json!({"sessionName": "Fall 2024", "schoolId": 255901}),
            json!({"sessionName": "Autumn 2024", "schoolId": 255901}),
        ))
        .await
        .unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_failed_key_change_reports_put_with_source_id() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ed-fi/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "t-42", "sessionName": "Fall 2024"}])))
        .mount(&target)
        .await;
    Mock::given(method("PUT"))
        .and(path("/ed-fi/sessions/t-42"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid"))
        .expect(1)
        .mount(&target)
        .await;

    let processor = KeyChangeProcessor::new(client("Target", &target), retry(3), 2);
    let record = processor
        .process(key_change(json!({"sessionName": "Fall 2024"}), json!({"sessionName": "Autumn 2024"})))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.method, "PUT");
    assert_eq!(record.id, "src-9");
    assert_eq!(record.body, Some(json!({"sessionName": "Autumn 2024"})));
}

#[tokio::test]
async fn test_failed_key_change_lookup_is_reported() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ed-fi/sessions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&target)
        .await;

    let processor = KeyChangeProcessor::new(client("Target", &target), retry(2), 2);
    let record = processor
        .process(key_change(json!({"sessionName": "Fall 2024"}), json!({"sessionName": "Autumn 2024"})))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.method, "GET");
    assert_eq!(record.response_status, Some(500));
}

// ============================================================================
// Deletes
// ============================================================================

fn delete(key_values: serde_json::Value) -> ActionMessage {
    ActionMessage::Delete(DeleteMessage {
        resource_url: "/ed-fi/students".to_string(),
        source_id: "src-3".to_string(),
        key_values: doc(key_values),
    })
}

#[tokio::test]
async fn test_delete_removes_matching_target_item() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ed-fi/students"))
        .and(query_param("studentUniqueId", "604822"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "t-7", "studentUniqueId": "604822"}])))
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/ed-fi/students/t-7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&target)
        .await;

    let processor = DeleteProcessor::new(client("Target", &target), retry(3), 2);
    let result = processor.process(delete(json!({"studentUniqueId": "604822"}))).await.unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_delete_without_target_match_is_skipped() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&target)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&target)
        .await;

    let processor = DeleteProcessor::new(client("Target", &target), retry(3), 2);
    let result = processor.process(delete(json!({"studentUniqueId": "604822"}))).await.unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_delete_retries_conflict() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "t-7"}])))
        .mount(&target)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/ed-fi/students/t-7"))
        .respond_with(ResponseTemplate::new(409))
        .up_to_n_times(1)
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/ed-fi/students/t-7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&target)
        .await;

    let processor = DeleteProcessor::new(client("Target", &target), retry(3), 2);
    let result = processor.process(delete(json!({"studentUniqueId": "604822"}))).await.unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_delete_of_already_removed_item_is_a_no_op() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "t-7"}])))
        .mount(&target)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/ed-fi/students/t-7"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&target)
        .await;

    let processor = DeleteProcessor::new(client("Target", &target), retry(3), 2);
    let result = processor.process(delete(json!({"studentUniqueId": "604822"}))).await.unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_failed_delete_reports_source_id() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "t-7"}])))
        .mount(&target)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/ed-fi/students/t-7"))
        .respond_with(ResponseTemplate::new(400).set_body_string("referenced"))
        .expect(1)
        .mount(&target)
        .await;

    let processor = DeleteProcessor::new(client("Target", &target), retry(3), 2);
    let record = processor
        .process(delete(json!({"studentUniqueId": "604822"})))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.method, "DELETE");
    assert_eq!(record.id, "src-3");
    assert_eq!(record.response_content, "referenced");
    assert!(record.body.is_none());
}
