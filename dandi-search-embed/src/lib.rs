//! # dandi-search-embed
//!
//! Text embeddings for semantic search over archive metadata.
//!
//! Providers implement [`EmbeddingProvider`] and turn text into vectors for a
//! given [`EmbedRole`]. The [`EmbeddingGenerator`] sits in front of a provider
//! and adds batching, bounded concurrency, timeouts, retries with jittered
//! backoff and output validation.
//!
//! ## Quick Start
//!
//! ```
//! use dandi_search_embed::{EmbedConfig, EmbedRole, EmbeddingGenerator};
//!
//! # async fn example() -> dandi_search_embed::Result<()> {
//! let generator = EmbeddingGenerator::from_config(&EmbedConfig::default()).await?;
//! let vector = generator.embed("olfactory bulb", EmbedRole::Query).await?;
//! assert_eq!(vector.len(), generator.dimension());
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - [`HashingProvider`]: deterministic FNV feature hashing, no model files
//! - [`FastEmbedProvider`]: local ONNX models, downloaded on first use

pub mod config;
pub mod error;
pub mod fastembed_provider;
pub mod generator;
pub mod hashing;
pub mod model;
pub mod provider;
pub mod retry;

// Re-export main types for easy access
pub use config::{EmbedConfig, EmbedConfigBuilder, PromptTemplates, ProviderKind};
pub use error::{EmbedError, Result};
pub use fastembed_provider::FastEmbedProvider;
pub use generator::{BatchOutcome, EmbeddingGenerator};
pub use hashing::HashingProvider;
pub use model::ModelDescriptor;
pub use provider::{EmbedRole, EmbeddingProvider, EmbeddingResult, l2_normalize};
pub use retry::RetryPolicy;

use std::sync::Arc;

/// Build the provider selected by `config`.
pub async fn build_provider(config: &EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    config.validate()?;
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        ProviderKind::Hashing => Arc::new(HashingProvider::new(
            config.model_name.clone(),
            config.model_version.clone(),
            config.dimension,
        )),
        ProviderKind::FastEmbed => Arc::new(FastEmbedProvider::create(config.clone()).await?),
    };
    tracing::info!(
        "Embedding provider ready: {}",
        provider.descriptor().model_id()
    );
    Ok(provider)
}

impl EmbeddingGenerator {
    /// Build the configured provider and wrap it in a generator.
    pub async fn from_config(config: &EmbedConfig) -> Result<Self> {
        let provider = build_provider(config).await?;
        Ok(Self::new(provider, config))
    }
}
