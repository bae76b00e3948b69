//! Storage abstraction layer for the search corpus
//!
//! The corpus store is the durable side of the engine: it holds the current
//! record per id, one embedding per `(record, model)`, stale-embedding marks,
//! registered embedding models and the archive change cursor. The vector
//! index is always rebuildable from it.
//!
//! ## Architecture
//!
//! ```text
//! CorpusIngestor ──┐
//!                  ├─ CorpusStore ── SqliteStore (concrete implementation)
//! RefreshScheduler ┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dandi_search_embed::ModelDescriptor;
use serde::Serialize;

use crate::record::{ChangeCursor, Payload, Record, RecordChange, TextHash};

pub mod sqlite_store;

pub use sqlite_store::SqliteStore;

/// What applying a single change did to the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    /// The stored row already matched the change
    Unchanged,
    Deleted,
    /// Delete of an id that was not stored
    Missing,
}

/// A record whose embedding for some model is missing or out of date.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    pub id: String,
    pub text: String,
    pub text_hash: TextHash,
}

/// An embedding joined with its record's payload, ready for the index.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub record_id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

/// A record whose latest embedding attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleMark {
    pub record_id: String,
    pub model_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub marked_at: DateTime<Utc>,
}

/// A registered embedding model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRow {
    pub descriptor: ModelDescriptor,
    pub is_current: bool,
    pub registered_at: DateTime<Utc>,
}

/// Durable corpus operations.
#[async_trait]
pub trait CorpusStore: Send + Sync {
    /// Apply changes in order inside one transaction.
    async fn apply_changes(&self, changes: &[RecordChange]) -> Result<Vec<ApplyOutcome>>;

    async fn get_record(&self, id: &str) -> Result<Option<Record>>;

    /// All stored record ids in ascending order.
    async fn record_ids(&self) -> Result<Vec<String>>;

    async fn record_count(&self) -> Result<usize>;

    /// Records with no embedding for `model_id`, or whose embedding was
    /// computed from a different text.
    async fn records_needing_embedding(&self, model_id: &str) -> Result<Vec<PendingRecord>>;

    /// Store embeddings and clear their stale marks. Rows whose record has
    /// been deleted or re-texted since are skipped.
    async fn store_embeddings(
        &self,
        model_id: &str,
        embeddings: &[(String, TextHash, Vec<f32>)],
    ) -> Result<usize>;

    async fn get_embedding(&self, record_id: &str, model_id: &str)
    -> Result<Option<StoredEmbedding>>;

    /// Every embedding stored for `model_id`, ordered by record id.
    async fn load_embeddings(&self, model_id: &str) -> Result<Vec<StoredEmbedding>>;

    async fn embedding_count(&self, model_id: &str) -> Result<usize>;

    /// Drop the `model_id` embeddings of `record_ids`, so they are embedded
    /// again by the next cycle.
    async fn delete_embeddings(&self, model_id: &str, record_ids: &[String]) -> Result<usize>;

    /// Record `(record_id, error)` failures for `model_id`.
    async fn mark_stale(&self, model_id: &str, failures: &[(String, String)]) -> Result<()>;

    async fn stale_marks(&self, model_id: &str) -> Result<Vec<StaleMark>>;

    async fn cursor(&self) -> Result<Option<ChangeCursor>>;

    async fn set_cursor(&self, cursor: ChangeCursor) -> Result<()>;

    async fn register_model(&self, descriptor: &ModelDescriptor) -> Result<()>;

    async fn set_current_model(&self, model_id: &str) -> Result<()>;

    async fn models(&self) -> Result<Vec<ModelRow>>;
}
