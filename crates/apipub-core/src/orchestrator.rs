//! Publishing orchestrator
//!
//! Runs the stages of a publishing run strictly in order
//! (key changes, upserts, deletes). Within a stage every resource gets its
//! own pipeline task; a resource starts streaming only when the resources it
//! is gated on have completed, and at most
//! `max_degree_of_parallelism_for_resource_processing` resources stream at
//! once. Each stage has its own error aggregator, which is drained before
//! the next stage begins.

use crate::client::ApiClient;
use crate::config::{AuthorizationFailureHandling, PublisherConfig};
use crate::dependencies::{DependencyGraph, DependencyProvider};
use crate::document::is_descriptor;
use crate::error_publishing::{ErrorAggregator, ErrorPublisher, ErrorSink};
use crate::model::{ChangeWindow, CompletionSignal, CompletionWaiter, PublishingStage, RetryQueue};
use crate::pipeline::{PipelineLimits, ResourcePipeline, ResourceSummary};
use crate::processing::{
    ActionProcessor, DeleteProcessor, KeyChangeProcessor, UpsertProcessor, UpsertRunState,
};
use crate::remediation::Remediator;
use crate::retry::RetrySettings;
use crate::streaming::streamer::wait_for_dependencies;
use crate::streaming::{
    ActionMessageProducer, DeleteMessageProducer, KeyChangeMessageProducer, PageFetcher,
    PagedResourceStreamer, ResourceStreamRequest, UpsertMessageProducer,
};
use apipub_common::{PublisherError, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Suffix of the synthetic node replaying deferred upserts for a resource.
pub const RETRY_NODE_SUFFIX: &str = "#Retry";

// ============================================================================
// Summaries
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: PublishingStage,
    pub resources: Vec<ResourceSummary>,
    /// Records received by the stage's error aggregator
    pub errors_published: usize,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishingSummary {
    pub run_id: Uuid,
    pub stages: Vec<StageSummary>,
    pub duration_seconds: f64,
}

impl PublishingSummary {
    pub fn total_errors(&self) -> usize {
        self.stages.iter().map(|s| s.errors_published).sum()
    }

    pub fn stage(&self, stage: PublishingStage) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

impl StageSummary {
    pub fn resource(&self, resource_url: &str) -> Option<&ResourceSummary> {
        self.resources.iter().find(|r| r.resource_url == resource_url)
    }
}

// ============================================================================
// Stage plan
// ============================================================================

/// One schedulable unit within a stage.
#[derive(Debug, Clone)]
enum StageNode {
    Resource(String),
    /// Replays deferred upserts of `resource`
    Retry { resource: String, queue: RetryQueue },
}

impl StageNode {
    fn name(&self) -> String {
        match self {
            StageNode::Resource(resource) => resource.clone(),
            StageNode::Retry { resource, .. } => format!("{}{}", resource, RETRY_NODE_SUFFIX),
        }
    }
}

/// Nodes of a stage and, per node, the nodes it waits for.
#[derive(Debug)]
struct StagePlan {
    nodes: Vec<StageNode>,
    gates: BTreeMap<String, Vec<String>>,
    retry_queues: BTreeMap<String, RetryQueue>,
}

impl StagePlan {
    fn build(
        stage: PublishingStage,
        resources: &[String],
        graph: &DependencyGraph,
        authorization_failure_handling: &[AuthorizationFailureHandling],
    ) -> Result<Self> {
        let members: Vec<String> = resources
            .iter()
            .filter(|r| stage != PublishingStage::KeyChanges || !is_descriptor(r))
            .cloned()
            .collect();
        let member_set: BTreeSet<&str> = members.iter().map(String::as_str).collect();
        let in_stage = |r: &String| member_set.contains(r.as_str());

        let mut nodes = Vec::new();
        let mut gates = BTreeMap::new();

        for resource in &members {
            let waits_for: Vec<String> = match stage {
                PublishingStage::Deletes => graph
                    .dependents_of(resource)
                    .into_iter()
                    .filter(|r| in_stage(r))
                    .collect(),
                _ => graph
                    .prerequisites_of(resource)
                    .iter()
                    .filter(|r| in_stage(*r))
                    .cloned()
                    .collect(),
            };
            gates.insert(resource.clone(), waits_for);
            nodes.push(StageNode::Resource(resource.clone()));
        }

        let mut retry_queues = BTreeMap::new();
        if stage == PublishingStage::Upserts {
            for handling in authorization_failure_handling {
                if !in_stage(&handling.path) || retry_queues.contains_key(&handling.path) {
                    continue;
                }
                let queue = RetryQueue::new();
                let node = StageNode::Retry {
                    resource: handling.path.clone(),
                    queue: queue.clone(),
                };

                let mut waits_for = vec![handling.path.clone()];
                waits_for.extend(
                    handling
                        .update_prerequisite_paths
                        .iter()
                        .filter(|p| in_stage(*p) && **p != handling.path)
                        .cloned(),
                );

                gates.insert(node.name(), waits_for);
                nodes.push(node);
                retry_queues.insert(handling.path.clone(), queue);
            }
        }

        let names: BTreeSet<String> = nodes.iter().map(StageNode::name).collect();
        DependencyGraph::new(gates.clone()).ensure_acyclic(&names)?;

        Ok(Self {
            nodes,
            gates,
            retry_queues,
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct PublishingOrchestrator {
    config: PublisherConfig,
    source: Arc<ApiClient>,
    target: Arc<ApiClient>,
    dependency_provider: Arc<dyn DependencyProvider>,
    error_sink: Arc<dyn ErrorSink>,
    remediator: Option<Arc<dyn Remediator>>,
}

impl PublishingOrchestrator {
    pub fn new(
        config: PublisherConfig,
        dependency_provider: Arc<dyn DependencyProvider>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Result<Self> {
        config.validate()?;
        let timeout = config.options.http_timeout();
        let source = Arc::new(ApiClient::new(&config.source, timeout)?);
        let target = Arc::new(ApiClient::new(&config.target, timeout)?);

        Ok(Self {
            config,
            source,
            target,
            dependency_provider,
            error_sink,
            remediator: None,
        })
    }

    pub fn with_remediator(mut self, remediator: Arc<dyn Remediator>) -> Self {
        self.remediator = Some(remediator);
        self
    }

    /// Resources of this run, in configured order, without duplicates.
    pub fn resources(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.config
            .resources
            .iter()
            .filter(|r| self.config.options.include_descriptors || !is_descriptor(r))
            .filter(|r| seen.insert(r.as_str()))
            .cloned()
            .collect()
    }

    /// Run every stage in order.
    pub async fn publish(&self) -> Result<PublishingSummary> {
        let run_id = Uuid::new_v4();
        let start = Instant::now();
        let resources = self.resources();

        info!(
            %run_id,
            source = %self.source.base_url(),
            target = %self.target.base_url(),
            resources = resources.len(),
            "Starting publishing run"
        );

        let graph = self.dependency_provider.get_dependencies().await?;
        let semaphore = Arc::new(Semaphore::new(
            self.config.options.max_degree_of_parallelism_for_resource_processing,
        ));
        let upsert_state = Arc::new(UpsertRunState::default());

        let mut stages = Vec::with_capacity(PublishingStage::ALL.len());
        for stage in PublishingStage::ALL {
            let summary = self
                .run_stage(stage, &resources, &graph, &semaphore, &upsert_state)
                .await?;
            stages.push(summary);
        }

        let summary = PublishingSummary {
            run_id,
            stages,
            duration_seconds: start.elapsed().as_secs_f64(),
        };

        info!(
            %run_id,
            errors = summary.total_errors(),
            duration_seconds = summary.duration_seconds,
            "Publishing run complete"
        );
        Ok(summary)
    }

    async fn run_stage(
        &self,
        stage: PublishingStage,
        resources: &[String],
        graph: &DependencyGraph,
        semaphore: &Arc<Semaphore>,
        upsert_state: &Arc<UpsertRunState>,
    ) -> Result<StageSummary> {
        let start = Instant::now();
        let plan = StagePlan::build(
            stage,
            resources,
            graph,
            &self.config.authorization_failure_handling,
        )?;

        info!(stage = %stage, nodes = plan.nodes.len(), "Starting stage");

        let options = &self.config.options;
        let (errors, aggregator) = ErrorAggregator::spawn(
            self.error_sink.clone(),
            options.error_publishing_batch_size,
            options.resource_item_channel_capacity,
        );

        let pipeline = self.pipeline();
        let processor = self.processor(stage, upsert_state)?;
        let stage_cancellation = CancellationToken::new();

        let mut signals: BTreeMap<String, CompletionSignal> = plan
            .nodes
            .iter()
            .map(|node| (node.name(), CompletionSignal::new()))
            .collect();
        let mut waiters: BTreeMap<String, Vec<CompletionWaiter>> = plan
            .gates
            .iter()
            .map(|(node, gates)| {
                let node_waiters = gates
                    .iter()
                    .filter_map(|gate| signals.get(gate).map(|s| s.waiter(gate.clone())))
                    .collect();
                (node.clone(), node_waiters)
            })
            .collect();

        let mut handles = Vec::with_capacity(plan.nodes.len());
        for node in plan.nodes.iter().cloned() {
            let name = node.name();
            let producer_queue = match &node {
                StageNode::Resource(resource) => plan.retry_queues.get(resource).cloned(),
                StageNode::Retry { .. } => None,
            };
            let signal = signals.remove(&name);

            let task = NodeTask {
                stage,
                node,
                waiters: waiters.remove(&name).unwrap_or_default(),
                pipeline: pipeline.clone(),
                processor: processor.clone(),
                producer_queue,
                errors: errors.clone(),
                cancellation: stage_cancellation.child_token(),
                semaphore: semaphore.clone(),
                page_size: options.streaming_page_size,
                change_window: self.config.effective_change_window(),
            };

            let stage_cancellation = stage_cancellation.clone();
            handles.push(tokio::spawn(async move {
                let _signal = signal;
                let result = task.run().await;
                if let Err(e) = &result {
                    error!(node = %name, error = %e, "Pipeline failed; cancelling stage");
                    stage_cancellation.cancel();
                }
                result
            }));
        }

        let mut summaries = Vec::with_capacity(handles.len());
        let mut failure = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                },
                Err(e) => {
                    failure.get_or_insert(PublisherError::pipeline(stage.as_str(), e.to_string()));
                },
            }
        }

        drop(errors);
        let errors_published = aggregator
            .await
            .map_err(|e| PublisherError::pipeline(stage.as_str(), format!("error aggregator: {}", e)))?;

        if let Some(e) = failure {
            return Err(e);
        }

        let summary = StageSummary {
            stage,
            resources: summaries,
            errors_published,
            duration_seconds: start.elapsed().as_secs_f64(),
        };
        info!(
            stage = %stage,
            resources = summary.resources.len(),
            errors = errors_published,
            duration_seconds = summary.duration_seconds,
            "Stage complete"
        );
        Ok(summary)
    }

    fn pipeline(&self) -> ResourcePipeline {
        let options = &self.config.options;
        let retry = RetrySettings::from_options(options);
        ResourcePipeline::new(
            PagedResourceStreamer::new(self.source.clone(), retry.clone()),
            PageFetcher::new(self.source.clone(), retry),
            PipelineLimits {
                page_parallelism: options.max_degree_of_parallelism_for_stream_resource_pages,
                pages_channel_capacity: options.streaming_pages_channel_capacity,
                items_channel_capacity: options.resource_item_channel_capacity,
            },
        )
    }

    fn processor(
        &self,
        stage: PublishingStage,
        upsert_state: &Arc<UpsertRunState>,
    ) -> Result<Arc<dyn ActionProcessor>> {
        let options = &self.config.options;
        let retry = RetrySettings::from_options(options);

        let processor: Arc<dyn ActionProcessor> = match stage {
            PublishingStage::KeyChanges => Arc::new(KeyChangeProcessor::new(
                self.target.clone(),
                retry,
                options.max_degree_of_parallelism_for_key_change_resource_item,
            )),
            PublishingStage::Upserts => {
                let mut processor = UpsertProcessor::new(
                    self.source.clone(),
                    self.target.clone(),
                    retry,
                    upsert_state.clone(),
                    options.max_degree_of_parallelism_for_post_resource_item,
                )?
                .with_primary_relationships(&self.config.authorization_failure_handling)
                .treat_forbidden_post_as_warning(self.config.target.treat_forbidden_post_as_warning);
                if let Some(remediator) = &self.remediator {
                    processor = processor.with_remediator(remediator.clone());
                }
                Arc::new(processor)
            },
            PublishingStage::Deletes => Arc::new(DeleteProcessor::new(
                self.target.clone(),
                retry,
                options.max_degree_of_parallelism_for_delete_resource_item,
            )),
        };
        Ok(processor)
    }
}

/// Everything one node task needs, moved into its spawned task.
struct NodeTask {
    stage: PublishingStage,
    node: StageNode,
    waiters: Vec<CompletionWaiter>,
    pipeline: ResourcePipeline,
    processor: Arc<dyn ActionProcessor>,
    producer_queue: Option<RetryQueue>,
    errors: ErrorPublisher,
    cancellation: CancellationToken,
    semaphore: Arc<Semaphore>,
    page_size: u64,
    change_window: Option<ChangeWindow>,
}

impl NodeTask {
    async fn run(self) -> Result<ResourceSummary> {
        match self.node {
            StageNode::Resource(resource) => {
                let producer: Arc<dyn ActionMessageProducer> = match self.stage {
                    PublishingStage::KeyChanges => Arc::new(KeyChangeMessageProducer::new(&resource)),
                    PublishingStage::Upserts => {
                        let producer = UpsertMessageProducer::new(&resource);
                        Arc::new(match self.producer_queue {
                            Some(queue) => producer.with_retry_queue(queue),
                            None => producer,
                        })
                    },
                    PublishingStage::Deletes => Arc::new(DeleteMessageProducer::new(&resource)),
                };

                let request = ResourceStreamRequest {
                    endpoint: self.stage.source_endpoint(&resource),
                    resource_url: resource,
                    page_size: self.page_size,
                    change_window: self.change_window,
                    dependencies: self.waiters,
                    cancellation: self.cancellation,
                    concurrency_limit: self.semaphore,
                };
                self.pipeline
                    .run(request, producer, self.processor, &self.errors)
                    .await
            },
            StageNode::Retry { resource, queue } => {
                let name = format!("{}{}", resource, RETRY_NODE_SUFFIX);
                wait_for_dependencies(&name, self.waiters).await;

                let items = queue.drain();
                if items.is_empty() || self.cancellation.is_cancelled() {
                    return Ok(ResourceSummary::new(name));
                }

                warn!(resource = %resource, items = items.len(), "Retrying items deferred by authorization failures");
                let mut summary = self
                    .pipeline
                    .replay(&resource, items, self.processor, self.cancellation, &self.errors)
                    .await?;
                summary.resource_url = name;
                Ok(summary)
            },
        }
    }
}
