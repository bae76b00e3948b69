use dandi_search_retriever::{QueryError, SearchEngine};
use rmcp::schemars;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SemanticSearchRequest {
    #[schemars(description = "Natural-language description of the datasets to find")]
    pub query: String,
}

/// Ranked dataset ids for `request.query`, serialized as a JSON array.
pub async fn dandi_semantic_search(
    engine: &SearchEngine,
    request: SemanticSearchRequest,
) -> Result<String, String> {
    info!("Processing semantic search: query={:?}", request.query);

    match engine.dandi_semantic_search(&request.query).await {
        Ok(ids) => serde_json::to_string(&ids).map_err(|e| e.to_string()),
        Err(QueryError::Invalid(e)) => Err(format!("Invalid query: {e}")),
        Err(e) => {
            warn!("Semantic search failed: {}", e);
            Err(format!("Search failed: {e}"))
        }
    }
}
