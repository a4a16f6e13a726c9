//! API Publisher - main entry point

use anyhow::{Context, Result};
use apipub_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use apipub_core::dependencies::{DependencyProvider, StaticDependencyProvider};
use apipub_core::error_publishing::{ErrorSink, FileErrorSink, LogErrorSink};
use apipub_core::model::ChangeWindow;
use apipub_core::remediation::StaticRemediator;
use apipub_core::{Cli, Commands, PublisherConfig, PublishingOrchestrator};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .output(LogOutput::Console)
        .log_file_prefix("apipub")
        .build();

    // Environment variables take precedence
    let log_config = log_config
        .with_env_overrides()
        .context("Invalid APIPUB_LOG_* configuration")?;
    init_logging(&log_config)?;

    match cli.command {
        Commands::Publish {
            config,
            min_change_version,
            max_change_version,
            errors_file,
            remediations,
            dependencies,
        } => {
            publish(
                config,
                ChangeWindow::new(min_change_version, max_change_version),
                errors_file,
                remediations,
                dependencies,
            )
            .await
        },
    }
}

async fn publish(
    config_path: PathBuf,
    window: ChangeWindow,
    errors_file: Option<PathBuf>,
    remediations: Option<PathBuf>,
    dependencies: Option<PathBuf>,
) -> Result<()> {
    let mut config = PublisherConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    if !window.is_empty() {
        let mut merged = config.change_window.unwrap_or_default();
        if window.min_change_version.is_some() {
            merged.min_change_version = window.min_change_version;
        }
        if window.max_change_version.is_some() {
            merged.max_change_version = window.max_change_version;
        }
        config.change_window = Some(merged);
        config.validate()?;
    }

    let dependency_provider: Arc<dyn DependencyProvider> = match dependencies {
        Some(path) => Arc::new(
            StaticDependencyProvider::from_file(&path)
                .with_context(|| format!("Failed to load dependencies from {}", path.display()))?,
        ),
        None => Arc::new(StaticDependencyProvider::new(config.dependencies.clone())),
    };

    let error_sink: Arc<dyn ErrorSink> = match errors_file {
        Some(path) => {
            info!(path = %path.display(), "Writing publishing errors to file");
            Arc::new(FileErrorSink::new(path))
        },
        None => Arc::new(LogErrorSink),
    };

    let mut orchestrator = PublishingOrchestrator::new(config, dependency_provider, error_sink)?;
    if let Some(path) = remediations {
        let remediator = StaticRemediator::from_file(&path)
            .with_context(|| format!("Failed to load remediations from {}", path.display()))?;
        info!(plans = remediator.len(), "Loaded remediation plans");
        orchestrator = orchestrator.with_remediator(Arc::new(remediator));
    }

    let summary = orchestrator.publish().await?;

    for stage in &summary.stages {
        info!(
            stage = %stage.stage,
            resources = stage.resources.len(),
            errors = stage.errors_published,
            duration_seconds = stage.duration_seconds,
            "Stage summary"
        );
    }

    if summary.total_errors() > 0 {
        warn!(
            run_id = %summary.run_id,
            errors = summary.total_errors(),
            "Publishing completed with errors"
        );
    } else {
        info!(run_id = %summary.run_id, "Publishing completed");
    }
    Ok(())
}
