//! Deterministic feature-hashing embeddings.
//!
//! Each token is hashed with FNV-1a into one of `dimension` buckets. Document
//! terms are weighted sublinearly (`1 + ln tf`); query terms count once, so a
//! repeated query word does not dominate the ranking. The provider needs no
//! model files, which makes it the default for tests and offline use.

use crate::error::Result;
use crate::model::ModelDescriptor;
use crate::provider::{EmbedRole, EmbeddingProvider, EmbeddingResult};
use async_trait::async_trait;
use fnv::{FnvHashMap, FnvHasher};
use std::hash::Hasher;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
    "of", "on", "or", "that", "the", "this", "to", "was", "were", "with",
];

#[derive(Debug, Clone)]
pub struct HashingProvider {
    descriptor: ModelDescriptor,
}

impl HashingProvider {
    pub fn new(model_name: impl Into<String>, model_version: impl Into<String>, dimension: usize) -> Self {
        Self {
            descriptor: ModelDescriptor::new("hashing", model_name, model_version, dimension),
        }
    }

    /// Lowercased alphanumeric tokens with stopwords removed. A text made only
    /// of stopwords keeps them so it still embeds to a non-zero vector.
    pub fn tokenize(text: &str) -> Vec<String> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        let content: Vec<String> = tokens
            .iter()
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
            .cloned()
            .collect();
        if content.is_empty() { tokens } else { content }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(token.as_bytes());
        (hasher.finish() % self.descriptor.dimension as u64) as usize
    }

    /// Embed one text. The result is not normalized.
    pub fn embed_one(&self, text: &str, role: EmbedRole) -> Vec<f32> {
        let mut counts: FnvHashMap<String, u32> = FnvHashMap::default();
        for token in Self::tokenize(text) {
            *counts.entry(token).or_insert(0) += 1;
        }

        let mut vector = vec![0.0f32; self.descriptor.dimension];
        for (token, tf) in counts {
            let weight = match role {
                EmbedRole::Document => 1.0 + (tf as f32).ln(),
                EmbedRole::Query => 1.0,
            };
            vector[self.bucket(&token)] += weight;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    async fn embed_texts(&self, texts: &[String], role: EmbedRole) -> Result<EmbeddingResult> {
        tracing::debug!("Hashing {} texts", texts.len());
        Ok(EmbeddingResult::new(
            texts.iter().map(|t| self.embed_one(t, role)).collect(),
        ))
    }

    fn embedding_dimension(&self) -> usize {
        self.descriptor.dimension
    }

    fn provider_name(&self) -> &str {
        &self.descriptor.provider
    }

    fn descriptor(&self) -> ModelDescriptor {
        self.descriptor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            HashingProvider::tokenize("Olfactory bulb recordings in the Rat!"),
            vec!["olfactory", "bulb", "recordings", "rat"]
        );
        assert_eq!(HashingProvider::tokenize("in the"), vec!["in", "the"]);
        assert!(HashingProvider::tokenize("?!").is_empty());
    }

    #[test]
    fn test_deterministic() {
        let provider = HashingProvider::new("fnv", "1", 128);
        let a = provider.embed_one("visual cortex imaging", EmbedRole::Document);
        let b = provider.embed_one("visual cortex imaging", EmbedRole::Document);
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
    }

    #[test]
    fn test_query_terms_are_binary() {
        let provider = HashingProvider::new("fnv", "1", 128);
        let query = provider.embed_one("rat rat rat", EmbedRole::Query);
        assert_eq!(query.iter().sum::<f32>(), 1.0);

        let doc = provider.embed_one("rat rat rat", EmbedRole::Document);
        let expected = 1.0 + 3.0f32.ln();
        assert!((doc.iter().sum::<f32>() - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_provider_trait() {
        let provider = HashingProvider::new("fnv", "1", 64);
        let result = provider
            .embed_texts(&["mouse".to_string(), "rat".to_string()], EmbedRole::Document)
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 64);
        assert_eq!(provider.provider_name(), "hashing");
        assert_eq!(provider.descriptor().model_id(), "hashing:fnv:1:64");
    }
}
