//! Configuration for embedding generation

use crate::error::{EmbedError, Result};
use crate::provider::EmbedRole;
use crate::retry::RetryPolicy;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which provider backs the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Deterministic FNV feature hashing. Needs no model files.
    #[default]
    Hashing,
    /// Local ONNX models through fastembed.
    FastEmbed,
}

/// Role-specific text templates. `{text}` is replaced with the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    pub query: String,
    pub document: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            query: "query: {text}".to_string(),
            document: "passage: {text}".to_string(),
        }
    }
}

impl PromptTemplates {
    /// Templates that pass text through unchanged.
    pub fn identity() -> Self {
        Self {
            query: "{text}".to_string(),
            document: "{text}".to_string(),
        }
    }

    pub fn apply(&self, role: EmbedRole, text: &str) -> String {
        let template = match role {
            EmbedRole::Query => &self.query,
            EmbedRole::Document => &self.document,
        };
        template.replace("{text}", text)
    }
}

/// Configuration for the embedding generator and its provider
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct EmbedConfig {
    pub provider: ProviderKind,
    /// Name of the embedding model to use
    pub model_name: String,
    /// Version token that becomes part of the model id
    pub model_version: String,
    /// Output dimension. Only the hashing provider honors it; fastembed
    /// models report their own.
    pub dimension: usize,
    /// Maximum number of texts per provider call
    pub batch_size: usize,
    /// Maximum number of provider calls in flight
    pub max_concurrency: usize,
    /// Per-call timeout in milliseconds
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub templates: PromptTemplates,
    /// Where fastembed keeps downloaded model files
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Hashing,
            model_name: "fnv-feature-hash".to_string(),
            model_version: "1".to_string(),
            dimension: 512,
            batch_size: 32,
            max_concurrency: 4,
            request_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            templates: PromptTemplates::default(),
            cache_dir: None,
        }
    }
}

impl EmbedConfig {
    /// Create a new embedding configuration using the builder
    pub fn builder() -> EmbedConfigBuilder {
        EmbedConfigBuilder::default()
    }

    /// Configuration for a fastembed model such as `bge-small-en-v1.5`.
    pub fn fastembed(model_name: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::FastEmbed,
            model_name: model_name.into(),
            batch_size: 16,
            max_concurrency: 1,
            ..Self::default()
        }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set the retry policy (builder style)
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(EmbedError::invalid_config("model_name must not be empty"));
        }
        if self.provider == ProviderKind::Hashing && self.dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be positive"));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be positive"));
        }
        if self.max_concurrency == 0 {
            return Err(EmbedError::invalid_config(
                "max_concurrency must be positive",
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(EmbedError::invalid_config(
                "request_timeout_ms must be positive",
            ));
        }
        for (name, template) in [
            ("query", &self.templates.query),
            ("document", &self.templates.document),
        ] {
            if !template.contains("{text}") {
                return Err(EmbedError::invalid_config(format!(
                    "{name} template must contain {{text}}"
                )));
            }
        }
        Ok(())
    }
}
