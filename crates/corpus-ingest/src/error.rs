//! Error taxonomy for the ingestion pipeline
//!
//! - transient network failures are retried, then degrade to a failed artifact
//! - permanent per-artifact failures mark the artifact failed and the run continues
//! - configuration errors abort a source run before any network I/O

use crate::artifact::ArtifactState;
use corpus_common::CorpusError;
use std::path::PathBuf;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Outcome of a single failed network operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Timeouts, connection resets, 5xx and 429 responses
    #[error("transient failure: {0}")]
    Transient(String),

    /// 4xx responses (other than 404/429), malformed or unsupported URLs
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("not found (HTTP 404)")]
    NotFound,

    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Error types for corpus ingestion
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Crawl root {url} could not be listed: {reason}")]
    CrawlRoot { url: String, reason: String },

    #[error("Fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("Extraction of {} failed: {reason}", path.display())]
    Extraction { path: PathBuf, reason: String },

    #[error("Loading {} failed: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("Structural mismatch in {}: {reason}", path.display())]
    StructuralMismatch { path: PathBuf, reason: String },

    #[error("Invalid artifact transition: {from} -> {to}")]
    InvalidTransition { from: ArtifactState, to: ArtifactState },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Pipeline task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] CorpusError),
}

impl IngestError {
    pub fn config(message: impl Into<String>) -> Self {
        IngestError::Configuration(message.into())
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Fetch { source, .. } => source.is_retryable(),
            IngestError::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_classification() {
        let transient = IngestError::Fetch {
            url: "http://example/a.zip".to_string(),
            source: FetchError::Transient("HTTP 503".to_string()),
        };
        assert!(transient.is_retryable());

        let permanent = IngestError::Fetch {
            url: "http://example/a.zip".to_string(),
            source: FetchError::Permanent("HTTP 403".to_string()),
        };
        assert!(!permanent.is_retryable());
    }
}
