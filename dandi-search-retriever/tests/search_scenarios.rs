//! End-to-end search scenarios over an in-memory archive.
//!
//! These tests drive the engine the way a deployment does:
//! - refresh cycles pulling from a changing archive
//! - ranking with the deterministic hashing model
//! - query validation and timeouts
//! - stale marking, partial ingestion and cancelled cycles

use anyhow::Result;
use async_trait::async_trait;
use dandi_search_embed::{
    EmbedConfig, EmbedError, EmbedRole, EmbeddingGenerator, EmbeddingProvider, EmbeddingResult,
    HashingProvider, ModelDescriptor,
};
use dandi_search_retriever::ingest::MemoryArchive;
use dandi_search_retriever::record::TextHash;
use dandi_search_retriever::storage::{
    ApplyOutcome, CorpusStore, ModelRow, PendingRecord, SqliteStore, StaleMark, StoredEmbedding,
};
use dandi_search_retriever::{
    ChangeCursor, CycleMode, EngineConfig, InvalidQueryError, QueryError, Record, RecordChange,
    RefreshPhase, SearchEngine, SearchFilter,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn dataset(id: &str, name: &str) -> Value {
    json!({"identifier": format!("DANDI:{id}"), "version": "1", "name": name})
}

async fn open(archive: Arc<MemoryArchive>) -> Result<SearchEngine> {
    SearchEngine::open_with_archive(EngineConfig::in_memory(), archive).await
}

/// Hashing embeddings, except that texts containing a marker word fail,
/// and query embedding can be slowed down.
struct FlakyProvider {
    inner: HashingProvider,
    failing: AtomicBool,
    slow_queries: AtomicBool,
    slow_documents: AtomicBool,
}

impl FlakyProvider {
    fn new() -> Self {
        Self {
            inner: HashingProvider::new("flaky", "1", 256),
            failing: AtomicBool::new(true),
            slow_queries: AtomicBool::new(false),
            slow_documents: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyProvider {
    async fn embed_texts(
        &self,
        texts: &[String],
        role: EmbedRole,
    ) -> dandi_search_embed::Result<EmbeddingResult> {
        let slow = match role {
            EmbedRole::Query => &self.slow_queries,
            EmbedRole::Document => &self.slow_documents,
        };
        if slow.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.failing.load(Ordering::SeqCst) && texts.iter().any(|t| t.contains("poison")) {
            return Err(EmbedError::provider("model rejected input", false));
        }
        self.inner.embed_texts(texts, role).await
    }

    fn embedding_dimension(&self) -> usize {
        self.inner.embedding_dimension()
    }

    fn provider_name(&self) -> &str {
        "flaky"
    }

    fn descriptor(&self) -> ModelDescriptor {
        self.inner.descriptor()
    }
}

async fn open_flaky(
    archive: Arc<MemoryArchive>,
    config: EngineConfig,
) -> Result<(SearchEngine, Arc<FlakyProvider>)> {
    let provider = Arc::new(FlakyProvider::new());
    let generator = Arc::new(EmbeddingGenerator::new(
        provider.clone(),
        &EmbedConfig::default(),
    ));
    let store = Arc::new(SqliteStore::open_memory().await?);
    let engine = SearchEngine::with_parts(config, store, archive, generator).await?;
    Ok((engine, provider))
}

/// SQLite corpus whose pending-record query can be made to fail once,
/// after a cycle has already applied its pull and moved the cursor.
struct LockingStore {
    inner: SqliteStore,
    lock_pending: AtomicBool,
}

#[async_trait]
impl CorpusStore for LockingStore {
    async fn apply_changes(&self, changes: &[RecordChange]) -> Result<Vec<ApplyOutcome>> {
        self.inner.apply_changes(changes).await
    }

    async fn get_record(&self, id: &str) -> Result<Option<Record>> {
        self.inner.get_record(id).await
    }

    async fn record_ids(&self) -> Result<Vec<String>> {
        self.inner.record_ids().await
    }

    async fn record_count(&self) -> Result<usize> {
        self.inner.record_count().await
    }

    async fn records_needing_embedding(&self, model_id: &str) -> Result<Vec<PendingRecord>> {
        if self.lock_pending.swap(false, Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        self.inner.records_needing_embedding(model_id).await
    }

    async fn store_embeddings(
        &self,
        model_id: &str,
        embeddings: &[(String, TextHash, Vec<f32>)],
    ) -> Result<usize> {
        self.inner.store_embeddings(model_id, embeddings).await
    }

    async fn get_embedding(
        &self,
        record_id: &str,
        model_id: &str,
    ) -> Result<Option<StoredEmbedding>> {
        self.inner.get_embedding(record_id, model_id).await
    }

    async fn load_embeddings(&self, model_id: &str) -> Result<Vec<StoredEmbedding>> {
        self.inner.load_embeddings(model_id).await
    }

    async fn embedding_count(&self, model_id: &str) -> Result<usize> {
        self.inner.embedding_count(model_id).await
    }

    async fn delete_embeddings(&self, model_id: &str, record_ids: &[String]) -> Result<usize> {
        self.inner.delete_embeddings(model_id, record_ids).await
    }

    async fn mark_stale(&self, model_id: &str, failures: &[(String, String)]) -> Result<()> {
        self.inner.mark_stale(model_id, failures).await
    }

    async fn stale_marks(&self, model_id: &str) -> Result<Vec<StaleMark>> {
        self.inner.stale_marks(model_id).await
    }

    async fn cursor(&self) -> Result<Option<ChangeCursor>> {
        self.inner.cursor().await
    }

    async fn set_cursor(&self, cursor: ChangeCursor) -> Result<()> {
        self.inner.set_cursor(cursor).await
    }

    async fn register_model(&self, descriptor: &ModelDescriptor) -> Result<()> {
        self.inner.register_model(descriptor).await
    }

    async fn set_current_model(&self, model_id: &str) -> Result<()> {
        self.inner.set_current_model(model_id).await
    }

    async fn models(&self) -> Result<Vec<ModelRow>> {
        self.inner.models().await
    }
}

#[tokio::test]
async fn test_olfactory_scenario_ranking() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert("DANDI:000001", dataset("000001", "olfactory bulb recordings in rat"));
    archive.upsert("DANDI:000002", dataset("000002", "visual cortex imaging in mouse"));
    archive.upsert("DANDI:000003", dataset("000003", "rat hippocampus electrophysiology"));
    let engine = open(archive).await?;
    engine.refresh_now().await?;

    let ids = engine.dandi_semantic_search("olfactory bulb rat").await?;
    assert_eq!(ids, vec!["000001", "000003", "000002"]);

    let top = engine.search("olfactory bulb rat", Some(1), None).await?;
    assert_eq!(top, vec!["000001"]);

    let scored = engine
        .search_with_scores("olfactory bulb rat", Some(3), None)
        .await?;
    assert!(scored.hits.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(scored.model_id, "hashing:fnv-feature-hash:1:512");
    Ok(())
}

#[tokio::test]
async fn test_equal_scores_are_ordered_by_id() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert("DANDI:000010", dataset("000010", "zebrafish larva calcium imaging"));
    archive.upsert("DANDI:000009", dataset("000009", "zebrafish larva calcium imaging"));
    let engine = open(archive).await?;
    engine.refresh_now().await?;

    let ids = engine.dandi_semantic_search("zebrafish").await?;
    assert_eq!(ids, vec!["000009", "000010"]);
    Ok(())
}

#[tokio::test]
async fn test_empty_corpus_returns_no_ids() -> Result<()> {
    let engine = open(Arc::new(MemoryArchive::new())).await?;
    assert!(engine.dandi_semantic_search("anything").await?.is_empty());

    let report = engine.refresh_now().await?;
    assert_eq!(report.pulled, 0);
    assert!(engine.dandi_semantic_search("anything").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_invalid_queries_are_rejected() -> Result<()> {
    let engine = open(Arc::new(MemoryArchive::new())).await?;

    assert!(matches!(
        engine.dandi_semantic_search("").await,
        Err(QueryError::Invalid(InvalidQueryError::Empty))
    ));
    assert!(matches!(
        engine.dandi_semantic_search(" \n\t ").await,
        Err(QueryError::Invalid(InvalidQueryError::Empty))
    ));
    assert!(matches!(
        engine.dandi_semantic_search(&"rat ".repeat(1000)).await,
        Err(QueryError::Invalid(InvalidQueryError::TooLong { .. }))
    ));
    assert!(matches!(
        engine.search("rat", Some(0), None).await,
        Err(QueryError::Invalid(InvalidQueryError::InvalidTopK { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn test_replayed_cycle_is_idempotent() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert("DANDI:000001", dataset("000001", "olfactory bulb recordings in rat"));
    archive.upsert("DANDI:000002", dataset("000002", "visual cortex imaging in mouse"));
    let engine = open(archive).await?;

    engine.refresh_now().await?;
    let before = engine.dandi_semantic_search("mouse cortex").await?;

    let again = engine.rebuild().await?;
    assert_eq!(again.inserted, 0);
    assert_eq!(again.unchanged, 2);
    assert_eq!(again.embedded, 0);
    assert_eq!(engine.index().len(), 2);
    assert_eq!(engine.dandi_semantic_search("mouse cortex").await?, before);
    Ok(())
}

#[tokio::test]
async fn test_upsert_and_delete_are_visible_after_refresh() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert("DANDI:000001", dataset("000001", "olfactory bulb recordings in rat"));
    let engine = open(archive.clone()).await?;
    engine.refresh_now().await?;

    archive.upsert("DANDI:000004", dataset("000004", "mouse hippocampus place cells"));
    engine.refresh_now().await?;
    let ids = engine.dandi_semantic_search("place cells").await?;
    assert_eq!(ids.first().map(String::as_str), Some("000004"));

    archive.delete("DANDI:000004");
    engine.refresh_now().await?;
    let ids = engine.search("place cells", Some(100), None).await?;
    assert!(!ids.contains(&"000004".to_string()));
    assert_eq!(ids, vec!["000001"]);

    // A new version replaces the old text.
    archive.upsert(
        "DANDI:000001",
        json!({"identifier": "DANDI:000001", "version": "2", "name": "zebrafish larva"}),
    );
    let report = engine.refresh_now().await?;
    assert_eq!(report.updated, 1);
    let ids = engine.dandi_semantic_search("zebrafish").await?;
    assert_eq!(ids, vec!["000001"]);
    Ok(())
}

#[tokio::test]
async fn test_payload_filter() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert(
        "DANDI:000001",
        json!({"identifier": "DANDI:000001", "version": "1", "name": "rat olfactory bulb", "category": "ephys"}),
    );
    archive.upsert(
        "DANDI:000002",
        json!({"identifier": "DANDI:000002", "version": "1", "name": "rat visual cortex", "category": "ophys"}),
    );
    let engine = open(archive).await?;
    engine.refresh_now().await?;

    let filter = SearchFilter::new().equals("category", "ophys");
    let ids = engine.search("rat", None, Some(&filter)).await?;
    assert_eq!(ids, vec!["000002"]);
    Ok(())
}

#[tokio::test]
async fn test_failed_embeddings_are_marked_stale() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert("DANDI:000001", dataset("000001", "olfactory bulb"));
    archive.upsert("DANDI:000002", dataset("000002", "poison visual cortex"));
    let (engine, provider) = open_flaky(archive, EngineConfig::in_memory()).await?;

    let report = engine.refresh_now().await?;
    assert_eq!(report.embedded, 1);
    assert_eq!(report.stale, vec!["000002"]);
    assert_eq!(engine.dandi_semantic_search("olfactory").await?, vec!["000001"]);

    let status = engine.status().await?;
    assert_eq!(status.stale.len(), 1);
    assert_eq!(status.stale[0].record_id, "000002");
    assert_eq!(status.corpus.pending, 1);

    provider.failing.store(false, Ordering::SeqCst);
    let report = engine.refresh_now().await?;
    assert_eq!(report.embedded, 1);
    assert!(report.stale.is_empty());
    assert!(engine.status().await?.stale.is_empty());
    assert_eq!(engine.dandi_semantic_search("visual cortex").await?[0], "000002");
    Ok(())
}

#[tokio::test]
async fn test_partial_ingestion_keeps_valid_records() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert("DANDI:000001", dataset("000001", "olfactory bulb"));
    archive.upsert("DANDI:000002", json!({"identifier": "DANDI:000002", "name": "no version"}));
    archive.upsert("DANDI:000003", dataset("000003", "visual cortex"));
    let engine = open(archive).await?;

    let report = engine.refresh_now().await?;
    let partial = report.partial.expect("one record is malformed");
    assert_eq!(partial.attempted, 3);
    assert_eq!(partial.failures.len(), 1);
    assert_eq!(partial.failures[0].id.as_deref(), Some("000002"));
    assert_eq!(engine.index().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_query_timeout() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert("DANDI:000001", dataset("000001", "olfactory bulb"));
    let mut config = EngineConfig::in_memory();
    config.query.timeout_ms = 50;
    let (engine, provider) = open_flaky(archive, config).await?;
    engine.refresh_now().await?;

    provider.slow_queries.store(true, Ordering::SeqCst);
    assert!(matches!(
        engine.dandi_semantic_search("olfactory").await,
        Err(QueryError::Timeout)
    ));

    provider.slow_queries.store(false, Ordering::SeqCst);
    assert_eq!(engine.dandi_semantic_search("olfactory").await?, vec!["000001"]);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_cycle_keeps_serving_and_forces_rebuild() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert("DANDI:000001", dataset("000001", "olfactory bulb"));
    let (engine, provider) = open_flaky(archive.clone(), EngineConfig::in_memory()).await?;
    engine.refresh_now().await?;
    let generation = engine.index().snapshot().number();

    archive.upsert("DANDI:000002", dataset("000002", "visual cortex"));
    provider.slow_documents.store(true, Ordering::SeqCst);
    let cancelled = tokio::time::timeout(Duration::from_millis(100), engine.refresh_now()).await;
    assert!(cancelled.is_err());

    let scheduler = engine.scheduler();
    assert_eq!(scheduler.phase(), RefreshPhase::Idle);
    assert!(scheduler.full_rebuild_pending());
    assert!(
        scheduler
            .last_error()
            .is_some_and(|e| e.contains("cancelled"))
    );
    assert_eq!(engine.index().snapshot().number(), generation);
    assert_eq!(engine.dandi_semantic_search("olfactory").await?, vec!["000001"]);

    provider.slow_documents.store(false, Ordering::SeqCst);
    let report = engine.refresh_now().await?;
    assert_eq!(report.mode, CycleMode::FullRebuild);
    assert!(!scheduler.full_rebuild_pending());
    assert_eq!(engine.index().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_model_migration_switches_generation() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert("DANDI:000001", dataset("000001", "olfactory bulb recordings in rat"));
    archive.upsert("DANDI:000002", dataset("000002", "visual cortex imaging in mouse"));
    let engine = open(archive).await?;
    engine.refresh_now().await?;

    let next = Arc::new(EmbeddingGenerator::new(
        Arc::new(HashingProvider::new("fnv-feature-hash", "2", 256)),
        &EmbedConfig::default(),
    ));
    let model_id = engine.migrate_model(next).await?;
    assert_eq!(engine.scheduler().target_model(), model_id);
    assert_eq!(engine.index().model_id(), "hashing:fnv-feature-hash:1:512");

    let report = engine.refresh_now().await?;
    assert_eq!(report.mode, CycleMode::FullRebuild);
    assert_eq!(report.embedded, 2);
    assert_eq!(engine.index().model_id(), model_id);
    assert_eq!(engine.index().snapshot().dimension(), 256);
    assert_eq!(
        engine.dandi_semantic_search("mouse cortex").await?[0],
        "000002"
    );

    let status = engine.status().await?;
    let current: Vec<_> = status.models.iter().filter(|m| m.is_current).collect();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].descriptor.model_id(), model_id);
    Ok(())
}

#[tokio::test]
async fn test_store_failure_after_pull_still_converges() -> Result<()> {
    let archive = Arc::new(MemoryArchive::new());
    archive.upsert("DANDI:000001", dataset("000001", "olfactory bulb recordings in rat"));
    archive.upsert("DANDI:000002", dataset("000002", "visual cortex imaging in mouse"));
    let store = Arc::new(LockingStore {
        inner: SqliteStore::open_memory().await?,
        lock_pending: AtomicBool::new(false),
    });
    let generator = Arc::new(EmbeddingGenerator::new(
        Arc::new(HashingProvider::new("fnv", "1", 256)),
        &EmbedConfig::default(),
    ));
    let engine =
        SearchEngine::with_parts(EngineConfig::in_memory(), store.clone(), archive.clone(), generator)
            .await?;
    engine.refresh_now().await?;

    archive.delete("DANDI:000001");
    store.lock_pending.store(true, Ordering::SeqCst);
    let err = engine.refresh_now().await.unwrap_err();
    assert!(err.to_string().contains("database is locked"));
    assert_eq!(store.record_ids().await?, vec!["000002"]);
    assert_eq!(store.cursor().await?, Some(ChangeCursor(3)));
    assert!(engine.scheduler().full_rebuild_pending());

    let report = engine.refresh_now().await?;
    assert_eq!(report.mode, CycleMode::FullRebuild);
    assert!(!engine.scheduler().full_rebuild_pending());
    assert_eq!(engine.search("olfactory bulb", Some(100), None).await?, vec!["000002"]);

    let report = engine.refresh_now().await?;
    assert_eq!(report.mode, CycleMode::Incremental);
    assert_eq!(engine.index().snapshot().ids(), vec!["000002"]);
    Ok(())
}
