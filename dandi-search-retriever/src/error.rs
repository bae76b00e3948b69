//! Error taxonomy for ingestion, indexing, querying and refresh.
//!
//! Only [`QueryError`] crosses the public search boundary. Archive, embedding
//! and publish failures are contained by the refresh scheduler and reported
//! through logs, cycle reports and the status API.

use crate::refresh::RefreshPhase;
use dandi_search_embed::EmbedError;
use serde::Serialize;

/// Failure talking to the archive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArchiveError {
    /// I/O errors, timeouts, 5xx and 429 responses. Retried with backoff.
    #[error("transient archive failure: {message}")]
    Transient { message: String },

    /// Malformed responses and client errors. Not retried.
    #[error("archive request failed: {message}")]
    Permanent { message: String },
}

impl ArchiveError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<reqwest::Error> for ArchiveError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout()
            || err.is_connect()
            || err.is_request()
            || err.is_body()
            || err
                .status()
                .is_some_and(|s| s.is_server_error() || s.as_u16() == 429);
        if retryable {
            Self::transient(err.to_string())
        } else {
            Self::permanent(err.to_string())
        }
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Self::permanent(err.to_string())
            }
            _ => Self::transient(err.to_string()),
        }
    }
}

/// One record that could not be ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestFailure {
    /// Identifier, when it could be extracted from the raw document.
    pub id: Option<String>,
    pub reason: String,
}

/// Summary of records skipped during a pull. Not fatal: the rest of the
/// batch is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{} of {attempted} records failed to ingest", failures.len())]
pub struct PartialIngestionError {
    pub attempted: usize,
    pub failures: Vec<IngestFailure>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexError {
    /// A staged generation failed validation and was not published.
    #[error("index corruption: {0}")]
    Corruption(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Rejected query input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidQueryError {
    #[error("query is empty")]
    Empty,

    #[error("query is {actual} characters long, the limit is {max}")]
    TooLong { max: usize, actual: usize },

    #[error("top_k must be between 1 and {max}, got {top_k}")]
    InvalidTopK { top_k: usize, max: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Invalid(#[from] InvalidQueryError),

    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbedError),

    #[error("no embedding model registered for {model_id}")]
    ModelUnavailable { model_id: String },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("query timed out")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("archive pull failed: {0}")]
    Pull(#[from] ArchiveError),

    #[error("publish failed: {0}")]
    Publish(#[from] IndexError),

    #[error("no embedding model registered for {model_id}")]
    ModelUnavailable { model_id: String },

    #[error("corpus store failure: {0}")]
    Store(#[from] anyhow::Error),

    #[error("refresh cycle cancelled during {phase:?}")]
    Cancelled { phase: RefreshPhase },
}
