//! Publisher configuration
//!
//! Loaded from a TOML file, then overridden by `APIPUB_*` environment
//! variables, then validated.

use crate::model::ChangeWindow;
use apipub_common::{PublisherError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Status codes retried as potentially transient when none are configured.
pub const DEFAULT_TRANSIENT_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

fn default_stream_pages_parallelism() -> usize {
    5
}

fn default_resource_processing_parallelism() -> usize {
    10
}

fn default_post_parallelism() -> usize {
    20
}

fn default_delete_parallelism() -> usize {
    5
}

fn default_key_change_parallelism() -> usize {
    5
}

fn default_page_size() -> u64 {
    100
}

fn default_channel_capacity() -> usize {
    100
}

fn default_retry_starting_delay_ms() -> u64 {
    100
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_error_batch_size() -> usize {
    25
}

fn default_true() -> bool {
    true
}

fn default_transient_status_codes() -> Vec<u16> {
    DEFAULT_TRANSIENT_STATUS_CODES.to_vec()
}

fn default_http_timeout_secs() -> u64 {
    300
}

// ============================================================================
// Connections
// ============================================================================

/// One endpoint of the replication (source or target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Name used in logs and remediation contexts
    pub name: String,

    /// Base URL of the resource API (e.g. `https://host/data/v3`)
    pub url: String,

    /// Pre-issued bearer token, if the API requires one
    #[serde(default)]
    pub access_token: Option<String>,

    /// Treat a 403 on POST as a warning and skip the rest of that resource
    #[serde(default)]
    pub treat_forbidden_post_as_warning: bool,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            access_token: None,
            treat_forbidden_post_as_warning: false,
        }
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(PublisherError::config(format!("{} connection url is empty", role)));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(PublisherError::config(format!(
                "{} connection url must be http(s), got '{}'",
                role, self.url
            )));
        }
        Ok(())
    }
}

/// Resources whose writes depend on prerequisite resources existing first.
///
/// Drives deferred retries after a 403 and automatic posting of unresolved
/// references after a 400.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationFailureHandling {
    pub path: String,
    #[serde(default)]
    pub update_prerequisite_paths: Vec<String>,
}

// ============================================================================
// Options
// ============================================================================

/// Tuning knobs for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherOptions {
    /// Concurrent page fetches per resource
    #[serde(default = "default_stream_pages_parallelism")]
    pub max_degree_of_parallelism_for_stream_resource_pages: usize,

    /// Resources allowed to stream at once (global semaphore)
    #[serde(default = "default_resource_processing_parallelism")]
    pub max_degree_of_parallelism_for_resource_processing: usize,

    #[serde(default = "default_post_parallelism")]
    pub max_degree_of_parallelism_for_post_resource_item: usize,

    #[serde(default = "default_delete_parallelism")]
    pub max_degree_of_parallelism_for_delete_resource_item: usize,

    #[serde(default = "default_key_change_parallelism")]
    pub max_degree_of_parallelism_for_key_change_resource_item: usize,

    #[serde(default = "default_page_size")]
    pub streaming_page_size: u64,

    #[serde(default = "default_channel_capacity")]
    pub streaming_pages_channel_capacity: usize,

    #[serde(default = "default_channel_capacity")]
    pub resource_item_channel_capacity: usize,

    #[serde(default = "default_retry_starting_delay_ms")]
    pub retry_starting_delay_milliseconds: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_error_batch_size")]
    pub error_publishing_batch_size: usize,

    #[serde(default = "default_true")]
    pub include_descriptors: bool,

    #[serde(default = "default_transient_status_codes")]
    pub transient_status_codes: Vec<u16>,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_seconds: u64,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism_for_stream_resource_pages:
                default_stream_pages_parallelism(),
            max_degree_of_parallelism_for_resource_processing:
                default_resource_processing_parallelism(),
            max_degree_of_parallelism_for_post_resource_item: default_post_parallelism(),
            max_degree_of_parallelism_for_delete_resource_item: default_delete_parallelism(),
            max_degree_of_parallelism_for_key_change_resource_item:
                default_key_change_parallelism(),
            streaming_page_size: default_page_size(),
            streaming_pages_channel_capacity: default_channel_capacity(),
            resource_item_channel_capacity: default_channel_capacity(),
            retry_starting_delay_milliseconds: default_retry_starting_delay_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            error_publishing_batch_size: default_error_batch_size(),
            include_descriptors: true,
            transient_status_codes: default_transient_status_codes(),
            http_timeout_seconds: default_http_timeout_secs(),
        }
    }
}

impl PublisherOptions {
    pub fn retry_starting_delay(&self) -> Duration {
        Duration::from_millis(self.retry_starting_delay_milliseconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        let parallelism = [
            (
                "max_degree_of_parallelism_for_stream_resource_pages",
                self.max_degree_of_parallelism_for_stream_resource_pages,
            ),
            (
                "max_degree_of_parallelism_for_resource_processing",
                self.max_degree_of_parallelism_for_resource_processing,
            ),
            (
                "max_degree_of_parallelism_for_post_resource_item",
                self.max_degree_of_parallelism_for_post_resource_item,
            ),
            (
                "max_degree_of_parallelism_for_delete_resource_item",
                self.max_degree_of_parallelism_for_delete_resource_item,
            ),
            (
                "max_degree_of_parallelism_for_key_change_resource_item",
                self.max_degree_of_parallelism_for_key_change_resource_item,
            ),
            (
                "streaming_pages_channel_capacity",
                self.streaming_pages_channel_capacity,
            ),
            (
                "resource_item_channel_capacity",
                self.resource_item_channel_capacity,
            ),
            ("error_publishing_batch_size", self.error_publishing_batch_size),
        ];

        for (name, value) in parallelism {
            if value == 0 {
                return Err(PublisherError::config(format!("{} must be greater than 0", name)));
            }
        }

        if self.streaming_page_size == 0 {
            return Err(PublisherError::config("streaming_page_size must be greater than 0"));
        }
        if self.max_retry_attempts == 0 {
            return Err(PublisherError::config("max_retry_attempts must be greater than 0"));
        }
        if self.http_timeout_seconds == 0 {
            return Err(PublisherError::config("http_timeout_seconds must be greater than 0"));
        }
        Ok(())
    }
}

// ============================================================================
// Publisher configuration
// ============================================================================

/// Everything needed for one publishing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub source: ConnectionConfig,
    pub target: ConnectionConfig,

    #[serde(default)]
    pub options: PublisherOptions,

    #[serde(default)]
    pub change_window: Option<ChangeWindow>,

    #[serde(default)]
    pub authorization_failure_handling: Vec<AuthorizationFailureHandling>,

    /// Resources to publish, e.g. `/ed-fi/students`
    #[serde(default)]
    pub resources: Vec<String>,

    /// Resource -> prerequisite resources
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl PublisherConfig {
    pub fn new(source: ConnectionConfig, target: ConnectionConfig) -> Self {
        Self {
            source,
            target,
            options: PublisherOptions::default(),
            change_window: None,
            authorization_failure_handling: Vec::new(),
            resources: Vec::new(),
            dependencies: BTreeMap::new(),
        }
    }

    /// Parse configuration from TOML text (no env overrides, no validation)
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| PublisherError::config(format!("invalid configuration file: {}", e)))
    }

    /// Load a TOML file, apply environment overrides, and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `APIPUB_*` environment overrides
    ///
    /// - `APIPUB_SOURCE_URL`, `APIPUB_TARGET_URL`
    /// - `APIPUB_SOURCE_ACCESS_TOKEN`, `APIPUB_TARGET_ACCESS_TOKEN`
    /// - `APIPUB_STREAMING_PAGE_SIZE`, `APIPUB_MAX_RETRY_ATTEMPTS`
    /// - `APIPUB_RETRY_STARTING_DELAY_MS`, `APIPUB_ERROR_PUBLISHING_BATCH_SIZE`
    /// - `APIPUB_INCLUDE_DESCRIPTORS`
    /// - `APIPUB_MIN_CHANGE_VERSION`, `APIPUB_MAX_CHANGE_VERSION`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("APIPUB_SOURCE_URL") {
            self.source.url = url;
        }
        if let Ok(url) = std::env::var("APIPUB_TARGET_URL") {
            self.target.url = url;
        }
        if let Ok(token) = std::env::var("APIPUB_SOURCE_ACCESS_TOKEN") {
            self.source.access_token = Some(token);
        }
        if let Ok(token) = std::env::var("APIPUB_TARGET_ACCESS_TOKEN") {
            self.target.access_token = Some(token);
        }

        if let Some(size) = env_parse("APIPUB_STREAMING_PAGE_SIZE")? {
            self.options.streaming_page_size = size;
        }
        if let Some(attempts) = env_parse("APIPUB_MAX_RETRY_ATTEMPTS")? {
            self.options.max_retry_attempts = attempts;
        }
        if let Some(delay) = env_parse("APIPUB_RETRY_STARTING_DELAY_MS")? {
            self.options.retry_starting_delay_milliseconds = delay;
        }
        if let Some(batch) = env_parse("APIPUB_ERROR_PUBLISHING_BATCH_SIZE")? {
            self.options.error_publishing_batch_size = batch;
        }
        if let Some(include) = env_parse("APIPUB_INCLUDE_DESCRIPTORS")? {
            self.options.include_descriptors = include;
        }

        let min = env_parse::<i64>("APIPUB_MIN_CHANGE_VERSION")?;
        let max = env_parse::<i64>("APIPUB_MAX_CHANGE_VERSION")?;
        if min.is_some() || max.is_some() {
            let mut window = self.change_window.unwrap_or_default();
            if min.is_some() {
                window.min_change_version = min;
            }
            if max.is_some() {
                window.max_change_version = max;
            }
            self.change_window = Some(window);
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.source.validate("source")?;
        self.target.validate("target")?;
        self.options.validate()?;

        if let Some(window) = &self.change_window {
            if !window.is_valid() {
                return Err(PublisherError::config(format!(
                    "min_change_version ({:?}) must not exceed max_change_version ({:?})",
                    window.min_change_version, window.max_change_version
                )));
            }
        }

        for handling in &self.authorization_failure_handling {
            if handling.path.trim().is_empty() {
                return Err(PublisherError::config(
                    "authorization_failure_handling entries need a path",
                ));
            }
        }

        Ok(())
    }

    /// The change window, or `None` when it has no bounds
    pub fn effective_change_window(&self) -> Option<ChangeWindow> {
        self.change_window.filter(|w| !w.is_empty())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| PublisherError::config(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}
