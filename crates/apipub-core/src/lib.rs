//! API Publisher core library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Replicates changed data from a source resource API to a target resource
//! API of the same model.
//!
//! # Overview
//!
//! A publishing run has three stages, run in order: key changes, upserts and
//! deletes. For every resource in a stage a pipeline is built:
//!
//! - [`streaming::PagedResourceStreamer`] counts the resource and emits page requests
//! - [`streaming::PageFetcher`] fetches pages and turns items into action messages
//! - [`processing`] applies the messages to the target with retry and backoff
//! - [`error_publishing`] batches unrecoverable failures into an error sink
//!
//! [`orchestrator::PublishingOrchestrator`] wires pipelines together, gating
//! each resource on its dependencies.
//!
//! # Example
//!
//! ```no_run
//! use apipub_core::config::PublisherConfig;
//! use apipub_core::dependencies::StaticDependencyProvider;
//! use apipub_core::error_publishing::LogErrorSink;
//! use apipub_core::orchestrator::PublishingOrchestrator;
//! use std::sync::Arc;
//!
//! # async fn run() -> apipub_common::Result<()> {
//! let config = PublisherConfig::load("apipub.toml")?;
//! let dependencies = Arc::new(StaticDependencyProvider::new(config.dependencies.clone()));
//! let orchestrator = PublishingOrchestrator::new(config, dependencies, Arc::new(LogErrorSink))?;
//! let summary = orchestrator.publish().await?;
//! println!("{} errors", summary.total_errors());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod dependencies;
pub mod document;
pub mod error_publishing;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod processing;
pub mod remediation;
pub mod retry;
pub mod streaming;

// Re-export commonly used types
pub use apipub_common::{PublisherError, Result};
pub use cli::{Cli, Commands};
pub use config::PublisherConfig;
pub use orchestrator::{PublishingOrchestrator, PublishingSummary};
