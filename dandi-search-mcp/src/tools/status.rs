use dandi_search_retriever::SearchEngine;
use tracing::{info, warn};

/// Engine status as pretty-printed JSON.
pub async fn status(engine: &SearchEngine) -> Result<String, String> {
    info!("Processing status request");

    let status = engine.status().await.map_err(|e| {
        warn!("Status collection failed: {}", e);
        format!("Status unavailable: {e}")
    })?;
    serde_json::to_string_pretty(&status).map_err(|e| e.to_string())
}
