//! dandi-search-retriever: semantic search over archive dataset metadata
//!
//! This crate keeps a vector index of archive records fresh and answers
//! natural-language queries with ranked record ids. It is built to run for a
//! long time next to an archive that changes continuously: refresh cycles
//! pull changes, embed new text and publish a new index generation
//! atomically, while queries keep being served from the previous one.
//!
//! ## Key Modules
//!
//! - **[`ingest`]**: Archive adapters and the ingestor that normalizes raw documents
//! - **[`storage`]**: Durable corpus store with SQLite implementation
//! - **[`index`]**: Sharded approximate nearest-neighbour index with generation swaps
//! - **[`query`]**: Query validation, embedding and ranking
//! - **[`refresh`]**: Refresh scheduler and its task queue
//! - **[`engine`]**: Facade wiring everything together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dandi_search_retriever::{EngineConfig, SearchEngine};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = SearchEngine::open(EngineConfig::default()).await?;
//! engine.start().await?;
//! let ids = engine.dandi_semantic_search("hippocampal place cells in rat").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Archive → CorpusIngestor → CorpusStore → EmbeddingGenerator → VectorIndex
//!    ↑                          ↑                                    ↓
//!  watch ──→ TaskQueue → RefreshScheduler            QueryProcessor ← query
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod ingest;
pub mod query;
pub mod record;
pub mod refresh;
pub mod status;
pub mod storage;

pub use config::EngineConfig;
pub use engine::SearchEngine;
pub use error::{
    ArchiveError, IndexError, InvalidQueryError, PartialIngestionError, QueryError, RefreshError,
};
pub use index::{SearchFilter, SearchHit, VectorIndex};
pub use query::{QueryProcessor, SearchResults};
pub use record::{ChangeCursor, Record, RecordChange};
pub use refresh::{CycleMode, CycleReport, RefreshPhase, RefreshScheduler};
pub use status::EngineStatus;
