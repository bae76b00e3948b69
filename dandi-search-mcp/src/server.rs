use crate::tools::{self, semantic_search::SemanticSearchRequest};
use anyhow::Result;
use dandi_search_retriever::SearchEngine;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::tool::Parameters;
use rmcp::model::{ServerCapabilities, ServerInfo};
use rmcp::{ServerHandler, ServiceExt, tool, tool_handler, tool_router};
use std::sync::Arc;
use tokio::io::{stdin, stdout};
use tracing::info;

/// MCP server exposing dataset search over a running [`SearchEngine`]
#[derive(Clone)]
pub struct DandiMcpServer {
    engine: Arc<SearchEngine>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl DandiMcpServer {
    pub fn new(engine: Arc<SearchEngine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    /// Semantic dataset search
    #[tool(
        description = "Find archive datasets matching a natural-language query. Returns a JSON array of dataset ids, best match first."
    )]
    async fn dandi_semantic_search(
        &self,
        Parameters(request): Parameters<SemanticSearchRequest>,
    ) -> Result<String, String> {
        tools::semantic_search::dandi_semantic_search(&self.engine, request).await
    }

    /// Status tool - index generation, corpus counters and refresh state
    #[tool(
        description = "Show search engine status: serving index generation and model, corpus and embedding counts, refresh phase, last cycle report and stale records"
    )]
    async fn status(&self) -> Result<String, String> {
        tools::status::status(&self.engine).await
    }

    /// Serve the MCP server using stdio transport
    pub async fn serve_stdio(&self) -> Result<()> {
        info!("Starting MCP server with stdio transport");

        let transport = (stdin(), stdout());
        let server = self.clone().serve(transport).await?;
        let quit_reason = server.waiting().await?;

        info!("MCP server quit: {:?}", quit_reason);
        Ok(())
    }
}

#[tool_handler]
impl ServerHandler for DandiMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "dandi-search MCP server - semantic search over archive dataset metadata".into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
