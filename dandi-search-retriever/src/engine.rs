//! The search engine facade: wires the corpus store, ingestor, embedding
//! models, vector index, query processor and refresh scheduler together.
//!
//! ```rust,no_run
//! use dandi_search_retriever::{EngineConfig, SearchEngine};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = SearchEngine::open(EngineConfig::load("dandi-search.toml".as_ref())?).await?;
//! engine.refresh_now().await?;
//! let ids = engine.dandi_semantic_search("rat olfactory bulb").await?;
//! println!("{ids:?}");
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use dandi_search_embed::EmbeddingGenerator;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{QueryError, RefreshError};
use crate::index::{SearchFilter, VectorIndex};
use crate::ingest::{Archive, CorpusIngestor, build_archive};
use crate::query::{ModelRegistry, QueryProcessor, SearchResults};
use crate::refresh::{
    CycleMode, CycleReport, RefreshScheduler, RefreshTask, ShutdownHandle, TaskPriority,
};
use crate::status::EngineStatus;
use crate::storage::{CorpusStore, SqliteStore};
use dandi_search_text::RecordNormalizer;

struct Background {
    shutdown: ShutdownHandle,
    task: JoinHandle<()>,
}

pub struct SearchEngine {
    config: EngineConfig,
    store: Arc<dyn CorpusStore>,
    archive: Arc<dyn Archive>,
    index: Arc<VectorIndex>,
    models: Arc<ModelRegistry>,
    scheduler: Arc<RefreshScheduler>,
    query: QueryProcessor,
    background: Mutex<Option<Background>>,
}

impl SearchEngine {
    /// Open an engine with the archive selected by `config.archive`.
    ///
    /// The engine serves queries immediately from whatever the corpus store
    /// already holds. Call [`start`](Self::start) to refresh in the
    /// background, or [`refresh_now`](Self::refresh_now) to run one cycle.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Database open or migration errors
    /// - Embedding model initialization errors
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let archive = build_archive(&config.archive)?;
        Self::open_with_archive(config, archive).await
    }

    /// Open an engine over a caller-supplied archive.
    pub async fn open_with_archive(config: EngineConfig, archive: Arc<dyn Archive>) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn CorpusStore> = match &config.storage.path {
            Some(path) => Arc::new(SqliteStore::open(path).await?),
            None => Arc::new(SqliteStore::open_memory().await?),
        };
        let generator = Arc::new(
            EmbeddingGenerator::from_config(&config.embedding)
                .await
                .context("initializing embedding model")?,
        );
        Self::assemble(config, store, archive, generator).await
    }

    /// Open an engine from already-built parts.
    pub async fn with_parts(
        config: EngineConfig,
        store: Arc<dyn CorpusStore>,
        archive: Arc<dyn Archive>,
        generator: Arc<EmbeddingGenerator>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, store, archive, generator).await
    }

    async fn assemble(
        config: EngineConfig,
        store: Arc<dyn CorpusStore>,
        archive: Arc<dyn Archive>,
        generator: Arc<EmbeddingGenerator>,
    ) -> Result<Self> {
        let model_id = generator.model_id();
        info!("Opening search engine with model {}", model_id);

        let previous = store
            .models()
            .await?
            .into_iter()
            .find(|m| m.is_current)
            .map(|m| m.descriptor.model_id());
        store.register_model(generator.descriptor()).await?;

        let index = Arc::new(VectorIndex::new(
            config.index.clone(),
            model_id.clone(),
            generator.dimension(),
        ));
        let models = Arc::new(ModelRegistry::new());
        models.register(generator.clone());

        let model_changed = previous.as_deref().is_some_and(|p| p != model_id);
        if !model_changed {
            store.set_current_model(&model_id).await?;
            let stored = store.load_embeddings(&model_id).await?;
            if !stored.is_empty() {
                let count = stored.len();
                match index.rebuild(stored, generator.descriptor()) {
                    Ok(generation) => {
                        info!("Loaded {} stored embeddings as generation {}", count, generation)
                    }
                    Err(err) => warn!("Stored embeddings rejected, waiting for a rebuild: {}", err),
                }
            }
        }

        let ingestor = CorpusIngestor::new(
            archive.clone(),
            RecordNormalizer::new(config.normalizer.clone()),
            config.archive.retry.clone(),
        );
        let scheduler = Arc::new(RefreshScheduler::new(
            store.clone(),
            ingestor,
            index.clone(),
            models.clone(),
            &config.refresh,
        ));
        if model_changed || (index.is_empty() && store.record_count().await? > 0) {
            info!(
                "Index for {} must be rebuilt (previous model {:?})",
                model_id, previous
            );
            scheduler.set_target_model(model_id);
        }

        let query = QueryProcessor::new(index.clone(), models.clone(), config.query.clone());
        Ok(Self {
            config,
            store,
            archive,
            index,
            models,
            scheduler,
            query,
            background: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn store(&self) -> &Arc<dyn CorpusStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    /// Start the background refresh loop. Archive change notifications are
    /// followed when `archive.watch` is set. Starting twice is a no-op.
    ///
    /// # Errors
    /// Failure to set up the archive watcher.
    pub async fn start(&self) -> Result<()> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Ok(());
        }

        let notifications = if self.config.archive.watch {
            self.archive.watch()?
        } else {
            None
        };
        let (shutdown, signal) = ShutdownHandle::new();
        let task = tokio::spawn(self.scheduler.clone().run(signal, notifications));
        if let Err(err) = self.scheduler.trigger(RefreshTask::incremental(
            TaskPriority::High,
            "engine started",
        )) {
            warn!("Initial refresh not queued: {}", err);
        }
        *background = Some(Background { shutdown, task });
        info!("Search engine started");
        Ok(())
    }

    /// Run one incremental cycle in the caller's task. Becomes a full
    /// rebuild when one is pending.
    pub async fn refresh_now(&self) -> Result<CycleReport, RefreshError> {
        self.scheduler.run_cycle(CycleMode::Incremental).await
    }

    /// Re-pull the full archive snapshot and rebuild the index.
    pub async fn rebuild(&self) -> Result<CycleReport, RefreshError> {
        self.scheduler.run_cycle(CycleMode::FullRebuild).await
    }

    /// Queue a refresh for the background loop.
    pub fn request_refresh(&self, mode: CycleMode, reason: &str) -> bool {
        let task = RefreshTask::new(mode, TaskPriority::High, reason);
        match self.scheduler.trigger(task) {
            Ok(()) => true,
            Err(err) => {
                warn!("Refresh request dropped: {}", err);
                false
            }
        }
    }

    /// The primary query operation: ids of the best matching records, best
    /// first, limited to the configured default `top_k`.
    ///
    /// # Errors
    /// - [`QueryError::Invalid`] for empty or oversized queries
    /// - [`QueryError::Timeout`] when the configured query timeout elapses
    /// - embedding and index failures
    pub async fn dandi_semantic_search(&self, query: &str) -> Result<Vec<String>, QueryError> {
        self.search(query, None, None).await
    }

    /// Ranked ids with an explicit `top_k` and payload filter.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<String>, QueryError> {
        Ok(self.search_with_scores(query, top_k, filter).await?.ids())
    }

    pub async fn search_with_scores(
        &self,
        query: &str,
        top_k: Option<usize>,
        filter: Option<&SearchFilter>,
    ) -> Result<SearchResults, QueryError> {
        tokio::time::timeout(
            self.config.query.timeout(),
            self.query.search_with_scores(query, top_k, filter),
        )
        .await
        .map_err(|_| QueryError::Timeout)?
    }

    /// Switch to a new embedding model. Queries keep using the current
    /// generation until a full rebuild with `generator` has been published.
    ///
    /// Returns the new model id.
    pub async fn migrate_model(&self, generator: Arc<EmbeddingGenerator>) -> Result<String> {
        let model_id = generator.model_id();
        info!(
            "Migrating from {} to {}",
            self.index.model_id(),
            model_id
        );
        self.store.register_model(generator.descriptor()).await?;
        self.models.register(generator);
        self.scheduler.set_target_model(model_id.clone());
        if let Err(err) = self.scheduler.trigger(RefreshTask::full_rebuild(
            TaskPriority::Critical,
            format!("migrate to {model_id}"),
        )) {
            warn!("Migration rebuild not queued, next cycle will run it: {}", err);
        }
        Ok(model_id)
    }

    /// Snapshot of the engine state.
    pub async fn status(&self) -> Result<EngineStatus> {
        EngineStatus::collect(self).await
    }

    /// Stop the background loop, cancelling a cycle in flight.
    pub async fn shutdown(&self) {
        let background = self.background.lock().await.take();
        if let Some(Background { shutdown, task }) = background {
            shutdown.shutdown();
            if let Err(err) = task.await {
                warn!("Refresh task ended abnormally: {}", err);
            }
        }
        info!("Search engine shut down");
    }
}
