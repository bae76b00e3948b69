//! Error types for the embedding system

use std::time::Duration;

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// Provider failures carry a `retryable` flag. The [`EmbeddingGenerator`]
/// retries retryable failures and timeouts with backoff; everything else
/// fails the affected texts immediately.
///
/// [`EmbeddingGenerator`]: crate::EmbeddingGenerator
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when model configuration is invalid
    #[error("Invalid model configuration: {message}")]
    InvalidConfig { message: String },

    /// Error during model initialization
    #[error("Model initialization failed: {source}")]
    ModelInitialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The provider rejected or failed a request
    #[error("Embedding provider failed: {message}")]
    Provider { message: String, retryable: bool },

    /// The provider did not answer within the request timeout
    #[error("Embedding request timed out after {after:?}")]
    Timeout { after: Duration },

    /// The provider returned a vector that cannot be indexed
    #[error("Invalid embedding vector: {message}")]
    InvalidVector { message: String },

    /// The provider returned a vector of the wrong dimension
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Wrap an error raised while loading a model.
    pub fn model_init<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelInitialization {
            source: Box::new(source),
        }
    }

    /// Create a provider error.
    pub fn provider<S: Into<String>>(message: S, retryable: bool) -> Self {
        Self::Provider {
            message: message.into(),
            retryable,
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an invalid vector error with a custom message.
    pub fn invalid_vector<S: Into<String>>(message: S) -> Self {
        Self::InvalidVector {
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}
