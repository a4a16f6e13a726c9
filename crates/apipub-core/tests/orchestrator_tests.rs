//! Full publishing runs against mock source and target APIs
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use apipub_core::config::AuthorizationFailureHandling;
use apipub_core::dependencies::StaticDependencyProvider;
use apipub_core::model::PublishingStage;
use apipub_core::orchestrator::PublishingOrchestrator;
use common::{publisher_config, CollectingSink};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Serve `items` from `endpoint` as a single page, including its count query.
async fn mount_source(server: &MockServer, endpoint: &str, items: Value) {
    let count = items.as_array().map(Vec::len).unwrap_or_default();
    Mock::given(method("GET"))
        .and(path(endpoint))
        .and(query_param("totalCount", "true"))
        .respond_with(ResponseTemplate::new(200).insert_header("Total-Count", count.to_string().as_str()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(endpoint))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items))
        .mount(server)
        .await;
}

/// Report nothing for the change endpoints that a test does not set up.
async fn mount_no_changes(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"/(keyChanges|deletes)$"))
        .respond_with(ResponseTemplate::new(200).insert_header("Total-Count", "0"))
        .with_priority(10)
        .mount(server)
        .await;
}

fn orchestrator(
    config: apipub_core::PublisherConfig,
    sink: Arc<CollectingSink>,
) -> PublishingOrchestrator {
    let dependencies = Arc::new(StaticDependencyProvider::new(config.dependencies.clone()));
    PublishingOrchestrator::new(config, dependencies, sink).unwrap()
}

#[tokio::test]
async fn test_publishes_prerequisites_before_dependents() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    mount_no_changes(&source).await;
    mount_source(&source, "/ed-fi/schools", json!([{"id": "sc1", "schoolId": 255901}])).await;
    mount_source(
        &source,
        "/ed-fi/students",
        json!([{"id": "st1", "studentUniqueId": "1"}, {"id": "st2", "studentUniqueId": "2"}]),
    )
    .await;

    Mock::given(method("POST"))
        .and(path("/ed-fi/schools"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(201))
        .expect(2)
        .mount(&target)
        .await;

    let mut config = publisher_config(&source, &target);
    // Listed in reverse so ordering comes from the dependency graph
    config.resources = vec!["/ed-fi/students".to_string(), "/ed-fi/schools".to_string()];
    config.dependencies = BTreeMap::from([(
        "/ed-fi/students".to_string(),
        vec!["/ed-fi/schools".to_string()],
    )]);

    let sink = Arc::new(CollectingSink::default());
    let summary = orchestrator(config, sink.clone()).publish().await.unwrap();

    assert_eq!(summary.stages.len(), 3);
    assert_eq!(summary.total_errors(), 0);
    assert!(sink.records().is_empty());

    let upserts = summary.stage(PublishingStage::Upserts).unwrap();
    assert_eq!(upserts.resource("/ed-fi/students").unwrap().messages, 2);
    assert_eq!(upserts.resource("/ed-fi/schools").unwrap().messages, 1);

    let posts: Vec<String> = target
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST")
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(posts, vec!["/ed-fi/schools", "/ed-fi/students", "/ed-fi/students"]);
}

#[tokio::test]
async fn test_failed_items_reach_the_error_sink() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    mount_no_changes(&source).await;
    mount_source(&source, "/ed-fi/students", json!([{"id": "st1", "studentUniqueId": "1"}])).await;

    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "invalid"})))
        .expect(1)
        .mount(&target)
        .await;

    let mut config = publisher_config(&source, &target);
    config.resources = vec!["/ed-fi/students".to_string()];

    let sink = Arc::new(CollectingSink::default());
    let summary = orchestrator(config, sink.clone()).publish().await.unwrap();

    assert_eq!(summary.total_errors(), 1);
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].resource_url, "/ed-fi/students");
    assert_eq!(records[0].method, "POST");
    assert_eq!(records[0].id, "st1");
    assert_eq!(records[0].response_status, Some(400));
}

#[tokio::test]
async fn test_forbidden_items_are_replayed_by_retry_node() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    mount_no_changes(&source).await;
    mount_source(&source, "/ed-fi/students", json!([{"id": "st1", "studentUniqueId": "1"}])).await;

    Mock::given(method("POST"))
        .and(path("/ed-fi/students"))
        .respond_with(ResponseTemplate::new(403))
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

    let mut config = publisher_config(&source, &target);
    config.resources = vec!["/ed-fi/students".to_string()];
    config.authorization_failure_handling = vec![AuthorizationFailureHandling {
        path: "/ed-fi/students".to_string(),
        update_prerequisite_paths: Vec::new(),
    }];

    let sink = Arc::new(CollectingSink::default());
    let summary = orchestrator(config, sink.clone()).publish().await.unwrap();

    assert_eq!(summary.total_errors(), 0);
    let upserts = summary.stage(PublishingStage::Upserts).unwrap();
    assert_eq!(upserts.resource("/ed-fi/students#Retry").unwrap().messages, 1);
}

#[tokio::test]
async fn test_key_changes_and_deletes_are_applied() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;

    mount_source(
        &source,
        "/ed-fi/students/keyChanges",
        json!([{
            "id": "k1",
            "changeVersion": 10,
            "oldKeyValues": {"studentUniqueId": "100"},
            "newKeyValues": {"studentUniqueId": "101"}
        }]),
    )
    .await;
    mount_source(&source, "/ed-fi/students", json!([])).await;
    mount_source(
        &source,
        "/ed-fi/students/deletes",
        json!([{"id": "d1", "changeVersion": 12, "keyValues": {"studentUniqueId": "900"}}]),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/ed-fi/students"))
        .and(query_param("studentUniqueId", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "t1", "studentUniqueId": "100"}])))
        .mount(&target)
        .await;
    Mock::given(method("PUT"))
        .and(path("/ed-fi/students/t1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("GET"))
        .and(path("/ed-fi/students"))
        .and(query_param("studentUniqueId", "900"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "t9"}])))
        .mount(&target)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/ed-fi/students/t9"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&target)
        .await;

    let mut config = publisher_config(&source, &target);
    config.resources = vec!["/ed-fi/students".to_string()];

    let sink = Arc::new(CollectingSink::default());
    let summary = orchestrator(config, sink.clone()).publish().await.unwrap();

    assert_eq!(summary.total_errors(), 0);
    let key_changes = summary.stage(PublishingStage::KeyChanges).unwrap();
    assert_eq!(key_changes.resource("/ed-fi/students").unwrap().messages, 1);
    let deletes = summary.stage(PublishingStage::Deletes).unwrap();
    assert_eq!(deletes.resource("/ed-fi/students").unwrap().messages, 1);
}

#[tokio::test]
async fn test_excluded_descriptors_are_not_published() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;
    mount_no_changes(&source).await;
    mount_source(&source, "/ed-fi/schools", json!([])).await;

    let mut config = publisher_config(&source, &target);
    config.options.include_descriptors = false;
    config.resources = vec![
        "/ed-fi/gradeLevelDescriptors".to_string(),
        "/ed-fi/schools".to_string(),
        "/ed-fi/schools".to_string(),
    ];

    let sink = Arc::new(CollectingSink::default());
    let orchestrator = orchestrator(config, sink);

    assert_eq!(orchestrator.resources(), vec!["/ed-fi/schools".to_string()]);
}

#[tokio::test]
async fn test_dependency_cycle_fails_the_run() {
    let source = MockServer::start().await;
    let target = MockServer::start().await;

    let mut config = publisher_config(&source, &target);
    config.resources = vec!["/ed-fi/a".to_string(), "/ed-fi/b".to_string()];
    config.dependencies = BTreeMap::from([
        ("/ed-fi/a".to_string(), vec!["/ed-fi/b".to_string()]),
        ("/ed-fi/b".to_string(), vec!["/ed-fi/a".to_string()]),
    ]);

    let sink = Arc::new(CollectingSink::default());
    let result = orchestrator(config, sink).publish().await;

    assert!(result.is_err());
}
