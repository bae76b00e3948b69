//! Embedding provider trait

use crate::error::{EmbedError, Result};
use crate::model::ModelDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a text is being embedded for. Asymmetric models encode queries and
/// documents differently, so the role travels with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedRole {
    Document,
    Query,
}

/// Result of embedding generation
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result. The dimension is inferred from the first
    /// vector and is 0 for an empty result.
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for embedding providers that can generate embeddings from text.
///
/// Implementations apply their own role-specific preprocessing and must be
/// deterministic: the same `(text, role)` always yields the same vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String], role: EmbedRole) -> Result<EmbeddingResult>;

    /// Generate an embedding for a single text
    async fn embed_text(&self, text: &str, role: EmbedRole) -> Result<Vec<f32>> {
        let result = self.embed_texts(&[text.to_string()], role).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::invalid_vector("no embedding generated for text"))
    }

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;

    /// Identity of the model behind this provider
    fn descriptor(&self) -> ModelDescriptor;
}

/// Scale `vector` to unit length in place. Returns the original norm.
pub fn l2_normalize(vector: &mut [f32]) -> f32 {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
    norm
}
