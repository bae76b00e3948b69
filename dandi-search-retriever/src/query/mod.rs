//! Query processing: validation, query embedding, index lookup and optional
//! reranking.

pub mod registry;
pub mod rerank;

pub use registry::ModelRegistry;
pub use rerank::{RecencyReranker, Reranker};

use dandi_search_embed::EmbedRole;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::QueryConfig;
use crate::error::{InvalidQueryError, QueryError};
use crate::index::{SearchFilter, SearchHit, VectorIndex};

/// Ranked hits with the generation and model that produced them.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub generation: u64,
    pub model_id: String,
    pub hits: Vec<SearchHit>,
}

impl SearchResults {
    pub fn ids(&self) -> Vec<String> {
        self.hits.iter().map(|h| h.id.clone()).collect()
    }
}

/// Stateless query front end over the vector index. Calls may be wrapped in
/// a timeout or dropped at any await point.
pub struct QueryProcessor {
    index: Arc<VectorIndex>,
    models: Arc<ModelRegistry>,
    config: QueryConfig,
    reranker: Option<Arc<dyn Reranker>>,
}

impl QueryProcessor {
    pub fn new(index: Arc<VectorIndex>, models: Arc<ModelRegistry>, config: QueryConfig) -> Self {
        let reranker = config
            .recency_field
            .clone()
            .map(|field| Arc::new(RecencyReranker::new(field)) as Arc<dyn Reranker>);
        Self {
            index,
            models,
            config,
            reranker,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Trim the query and resolve `top_k`.
    pub fn validate<'a>(
        &self,
        text: &'a str,
        top_k: Option<usize>,
    ) -> Result<(&'a str, usize), InvalidQueryError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(InvalidQueryError::Empty);
        }
        let chars = text.chars().count();
        if chars > self.config.max_query_chars {
            return Err(InvalidQueryError::TooLong {
                max: self.config.max_query_chars,
                actual: chars,
            });
        }
        let top_k = top_k.unwrap_or(self.config.default_top_k);
        if top_k == 0 || top_k > self.config.max_top_k {
            return Err(InvalidQueryError::InvalidTopK {
                top_k,
                max: self.config.max_top_k,
            });
        }
        Ok((text, top_k))
    }

    /// Ranked record ids for `text`.
    pub async fn search(
        &self,
        text: &str,
        top_k: Option<usize>,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<String>, QueryError> {
        Ok(self.search_with_scores(text, top_k, filter).await?.ids())
    }

    pub async fn search_with_scores(
        &self,
        text: &str,
        top_k: Option<usize>,
        filter: Option<&SearchFilter>,
    ) -> Result<SearchResults, QueryError> {
        let (query, top_k) = self.validate(text, top_k)?;

        // Pin one generation so the embedding model and the vectors agree.
        let generation = self.index.snapshot();
        if generation.is_empty() {
            return Ok(SearchResults {
                generation: generation.number(),
                model_id: generation.model_id().to_string(),
                hits: Vec::new(),
            });
        }

        let generator =
            self.models
                .get(generation.model_id())
                .ok_or_else(|| QueryError::ModelUnavailable {
                    model_id: generation.model_id().to_string(),
                })?;
        let vector = generator.embed(query, EmbedRole::Query).await?;
        let mut hits = generation.search(&vector, top_k, filter, self.index.config().max_probe)?;
        if let Some(reranker) = &self.reranker {
            reranker.rerank(&mut hits);
        }
        debug!(
            "Query {:?} matched {} hits in generation {}",
            query,
            hits.len(),
            generation.number()
        );

        Ok(SearchResults {
            generation: generation.number(),
            model_id: generation.model_id().to_string(),
            hits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::record::Payload;
    use dandi_search_embed::{EmbedConfig, EmbeddingGenerator, HashingProvider};
    use serde_json::json;

    fn generator() -> Arc<EmbeddingGenerator> {
        Arc::new(EmbeddingGenerator::new(
            Arc::new(HashingProvider::new("fnv", "1", 256)),
            &EmbedConfig::default(),
        ))
    }

    async fn processor(docs: &[(&str, &str, Payload)]) -> QueryProcessor {
        let generator = generator();
        let index = Arc::new(VectorIndex::new(
            IndexConfig::default(),
            generator.model_id(),
            generator.dimension(),
        ));
        for (id, text, payload) in docs {
            let vector = generator.embed(text, EmbedRole::Document).await.unwrap();
            index.upsert(*id, vector, payload.clone()).unwrap();
        }
        let models = Arc::new(ModelRegistry::new());
        models.register(generator);
        QueryProcessor::new(index, models, QueryConfig::default())
    }

    #[tokio::test]
    async fn test_validation() {
        let processor = processor(&[]).await;
        assert_eq!(processor.validate("  rat ", None), Ok(("rat", 10)));
        assert_eq!(
            processor.validate(" \t\n", None),
            Err(InvalidQueryError::Empty)
        );
        assert!(matches!(
            processor.validate(&"x".repeat(2000), None),
            Err(InvalidQueryError::TooLong { actual: 2000, .. })
        ));
        assert_eq!(
            processor.validate("rat", Some(0)),
            Err(InvalidQueryError::InvalidTopK { top_k: 0, max: 100 })
        );
        assert!(processor.validate("rat", Some(101)).is_err());
    }

    #[tokio::test]
    async fn test_empty_index_returns_no_ids() {
        let processor = processor(&[]).await;
        assert!(processor.search("rat", None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ranks_matching_records_first() {
        let processor = processor(&[
            ("A", "olfactory bulb recordings in rat", Payload::new()),
            ("B", "visual cortex imaging in mouse", Payload::new()),
            ("C", "rat hippocampus place cells", Payload::new()),
        ])
        .await;

        let ids = processor.search("rat olfactory", Some(2), None).await.unwrap();
        assert_eq!(ids, vec!["A", "C"]);

        let results = processor
            .search_with_scores("rat olfactory", Some(3), None)
            .await
            .unwrap();
        assert_eq!(results.hits.len(), 3);
        assert!(results.hits[0].score >= results.hits[1].score);
        assert!(results.hits[1].score >= results.hits[2].score);
    }

    #[tokio::test]
    async fn test_filter_restricts_results() {
        let mut ephys = Payload::new();
        ephys.insert("category".into(), json!("ephys"));
        let processor = processor(&[
            ("A", "olfactory bulb recordings in rat", Payload::new()),
            ("C", "rat hippocampus place cells", ephys),
        ])
        .await;

        let filter = SearchFilter::new().equals("category", "ephys");
        let ids = processor
            .search("rat olfactory", None, Some(&filter))
            .await
            .unwrap();
        assert_eq!(ids, vec!["C"]);
    }

    #[tokio::test]
    async fn test_unknown_model_is_reported() {
        let generator = generator();
        let index = Arc::new(VectorIndex::new(IndexConfig::default(), "other:model:1:256", 256));
        let vector = generator.embed("rat", EmbedRole::Document).await.unwrap();
        index.upsert("A", vector, Payload::new()).unwrap();
        let models = Arc::new(ModelRegistry::new());
        models.register(generator);

        let processor = QueryProcessor::new(index, models, QueryConfig::default());
        assert!(matches!(
            processor.search("rat", None, None).await,
            Err(QueryError::ModelUnavailable { .. })
        ));
    }
}
