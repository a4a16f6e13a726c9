//! Error sinks
//!
//! A sink receives whole batches. Failures are reported back to the
//! aggregator, which logs and drops them.

use crate::model::ErrorRecord;
use apipub_common::{PublisherError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn publish(&self, batch: &[ErrorRecord]) -> Result<()>;
}

/// Writes each record as a structured warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorSink;

#[async_trait]
impl ErrorSink for LogErrorSink {
    async fn publish(&self, batch: &[ErrorRecord]) -> Result<()> {
        for record in batch {
            warn!(
                resource = %record.resource_url,
                method = %record.method,
                id = %record.id,
                status = ?record.response_status,
                response = %record.response_content,
                "Unrecoverable publishing error"
            );
        }
        Ok(())
    }
}

/// Appends records to a JSON-lines file, one record per line.
#[derive(Debug)]
pub struct FileErrorSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileErrorSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ErrorSink for FileErrorSink {
    async fn publish(&self, batch: &[ErrorRecord]) -> Result<()> {
        let mut lines = String::new();
        for record in batch {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                PublisherError::error_sink(format!("cannot open {}: {}", self.path.display(), e))
            })?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
