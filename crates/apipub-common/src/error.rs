//! Error types for the API Publisher

use thiserror::Error;

/// Result type alias for publisher operations
pub type Result<T> = std::result::Result<T, PublisherError>;

/// Main error type for the publisher.
///
/// Per-item failures against the source or target API are not errors in this
/// sense; they are captured as error records and published to an error sink.
/// A `PublisherError` escaping a pipeline stage terminates the run.
#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Dependency graph error: {0}")]
    Dependency(String),

    #[error("Remediation failed for '{key}': {message}")]
    Remediation { key: String, message: String },

    #[error("Error sink failed: {0}")]
    ErrorSink(String),

    #[error("Unexpected message for {stage} processor: {message}")]
    UnexpectedMessage { stage: String, message: String },

    #[error("Pipeline failure in {stage}: {message}")]
    Pipeline { stage: String, message: String },
}

impl PublisherError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid document error
    pub fn invalid_document(msg: impl Into<String>) -> Self {
        Self::InvalidDocument(msg.into())
    }

    /// Create a dependency graph error
    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::Dependency(msg.into())
    }

    /// Create a remediation error
    pub fn remediation(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remediation {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an error sink error
    pub fn error_sink(msg: impl Into<String>) -> Self {
        Self::ErrorSink(msg.into())
    }

    /// Create a pipeline-fatal error
    pub fn pipeline(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pipeline {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_remediation_error_message() {
        let err = PublisherError::remediation("/ed-fi/students/400", "script crashed");
        assert_eq!(
            err.to_string(),
            "Remediation failed for '/ed-fi/students/400': script crashed"
        );
    }

    #[test]
    fn test_serialization_error_converts() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: PublisherError = parse.unwrap_err().into();
        assert!(matches!(err, PublisherError::Serialization(_)));
    }
}
