//! Tool implementations for the dandi-search MCP server
//!
//! Each tool is a plain async function over a [`SearchEngine`] so it can be
//! tested without an MCP transport. Failures are returned as the text the
//! client sees.
//!
//! [`SearchEngine`]: dandi_search_retriever::SearchEngine

pub mod semantic_search;
pub mod status;
