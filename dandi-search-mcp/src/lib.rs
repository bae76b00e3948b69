//! # dandi-search-mcp
//!
//! A Model Context Protocol (MCP) server that exposes dataset search to AI
//! clients. The server owns a [`SearchEngine`], keeps its index fresh in the
//! background and answers tool calls over stdio.
//!
//! ## MCP Tools
//!
//! ### `dandi_semantic_search`
//! Takes `{"query": "..."}` and returns a JSON array of dataset ids, best
//! match first. Empty or oversized queries are rejected with a message.
//!
//! ### `status`
//! Returns the engine status as JSON: the serving generation and model,
//! corpus and embedding counts, refresh phase, last cycle report and stale
//! records.
//!
//! ## Integration with MCP clients
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "dandi-search": {
//!       "command": "dandi-search-mcp",
//!       "args": ["--config", "/path/to/dandi-search.toml"]
//!     }
//!   }
//! }
//! ```

mod server;
pub mod tools;

pub use server::DandiMcpServer;

use anyhow::Result;
use dandi_search_retriever::{EngineConfig, SearchEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Configuration for the MCP server process.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Engine configuration file. Defaults apply when unset.
    pub config_path: Option<PathBuf>,
    /// Corpus database, overriding the configuration file
    pub db_path: Option<PathBuf>,
    /// Serve the stored index without refreshing it
    pub read_only: bool,
}

impl ServerConfig {
    /// Resolve the engine configuration.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config_path {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(db) = &self.db_path {
            config.storage.path = Some(db.clone());
        }
        Ok(config)
    }
}

/// Open the engine, start background refresh unless `read_only`, and serve
/// MCP over stdio until the client disconnects.
///
/// # Errors
/// - Configuration or engine initialization errors
/// - MCP protocol communication errors
pub async fn run_server(config: ServerConfig) -> Result<()> {
    info!("Starting dandi-search MCP server");
    let engine = Arc::new(SearchEngine::open(config.engine_config()?).await?);
    if !config.read_only {
        engine.start().await?;
    }

    let result = DandiMcpServer::new(engine.clone()).serve_stdio().await;
    engine.shutdown().await;
    result
}
