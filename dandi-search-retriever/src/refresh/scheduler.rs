//! The refresh state machine and its background loop.

use chrono::{DateTime, Utc};
use dandi_search_embed::{EmbedRole, EmbeddingGenerator};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::task_queue::{RefreshTask, TaskPriority, TaskQueue, TaskQueueError};
use super::{CycleMode, RefreshPhase};
use crate::config::RefreshConfig;
use crate::error::{PartialIngestionError, RefreshError};
use crate::index::{IndexOp, VectorIndex};
use crate::ingest::CorpusIngestor;
use crate::query::ModelRegistry;
use crate::record::{ChangeCursor, RecordChange, TextHash, shard_for};
use crate::storage::{ApplyOutcome, CorpusStore, StoredEmbedding};

/// Summary of one completed refresh cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub mode: CycleMode,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub pulled: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub missing: usize,
    pub embedded: usize,
    /// Records whose embedding failed this cycle
    pub stale: Vec<String>,
    /// Stored embeddings discarded as corrupt during a full rebuild
    pub discarded: usize,
    pub partial: Option<PartialIngestionError>,
    pub generation: u64,
    pub model_id: String,
    pub cursor: ChangeCursor,
}

impl CycleReport {
    fn new(mode: CycleMode, model_id: String) -> Self {
        Self {
            mode,
            started_at: Utc::now(),
            duration_ms: 0,
            pulled: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            missing: 0,
            embedded: 0,
            stale: Vec::new(),
            discarded: 0,
            partial: None,
            generation: 0,
            model_id,
            cursor: ChangeCursor::default(),
        }
    }

    fn count(&mut self, outcomes: &[ApplyOutcome]) {
        for outcome in outcomes {
            match outcome {
                ApplyOutcome::Inserted => self.inserted += 1,
                ApplyOutcome::Updated => self.updated += 1,
                ApplyOutcome::Unchanged => self.unchanged += 1,
                ApplyOutcome::Deleted => self.deleted += 1,
                ApplyOutcome::Missing => self.missing += 1,
            }
        }
    }
}

/// Receiving side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolves once shutdown is requested or the handle is dropped.
    pub async fn cancelled(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

#[derive(Debug)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), ShutdownSignal(rx))
    }

    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// Resets the phase when a cycle ends. A cycle dropped before it finished
/// forces the next one to rebuild from the corpus.
struct CycleGuard<'a> {
    scheduler: &'a RefreshScheduler,
    finished: bool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let err = RefreshError::Cancelled {
                phase: self.scheduler.phase(),
            };
            warn!("{}, next cycle will rebuild", err);
            self.scheduler.set_last_error(Some(err.to_string()));
            self.scheduler.force_full.store(true, Ordering::SeqCst);
        }
        self.scheduler.set_phase(RefreshPhase::Idle);
    }
}

struct Pulled {
    touched: BTreeSet<String>,
}

pub struct RefreshScheduler {
    store: Arc<dyn CorpusStore>,
    ingestor: CorpusIngestor,
    index: Arc<VectorIndex>,
    models: Arc<ModelRegistry>,
    target_model: RwLock<String>,
    queue: TaskQueue,
    phase: watch::Sender<RefreshPhase>,
    force_full: AtomicBool,
    cycle_lock: Mutex<()>,
    last_report: RwLock<Option<CycleReport>>,
    last_error: RwLock<Option<String>>,
    interval: Duration,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<dyn CorpusStore>,
        ingestor: CorpusIngestor,
        index: Arc<VectorIndex>,
        models: Arc<ModelRegistry>,
        config: &RefreshConfig,
    ) -> Self {
        let target = models.current_id().unwrap_or_else(|| index.model_id());
        Self {
            store,
            ingestor,
            index,
            models,
            target_model: RwLock::new(target),
            queue: TaskQueue::new(config.queue.clone()),
            phase: watch::channel(RefreshPhase::Idle).0,
            force_full: AtomicBool::new(false),
            cycle_lock: Mutex::new(()),
            last_report: RwLock::new(None),
            last_error: RwLock::new(None),
            interval: config.interval(),
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        *self.phase.borrow()
    }

    /// Observe phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<RefreshPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: RefreshPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!("Refresh phase {:?} -> {:?}", previous, phase);
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn trigger(&self, task: RefreshTask) -> Result<(), TaskQueueError> {
        self.queue.submit(task)
    }

    pub fn target_model(&self) -> String {
        self.target_model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switch the model new generations are built with. The next cycle is a
    /// full rebuild.
    pub fn set_target_model(&self, model_id: impl Into<String>) {
        let model_id = model_id.into();
        info!("Refresh target model is now {}", model_id);
        *self
            .target_model
            .write()
            .unwrap_or_else(PoisonError::into_inner) = model_id;
        self.force_full.store(true, Ordering::SeqCst);
    }

    pub fn full_rebuild_pending(&self) -> bool {
        self.force_full.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Run one refresh cycle. Cycles never overlap; a second caller waits
    /// for the running cycle to finish.
    pub async fn run_cycle(&self, requested: CycleMode) -> Result<CycleReport, RefreshError> {
        let _running = self.cycle_lock.lock().await;
        let mut guard = CycleGuard {
            scheduler: self,
            finished: false,
        };

        let target = self.target_model();
        let mode = if self.force_full.load(Ordering::SeqCst) || target != self.index.model_id() {
            CycleMode::FullRebuild
        } else {
            requested
        };
        let started = Instant::now();
        info!("Starting {:?} refresh cycle for {}", mode, target);

        let result = self.cycle(mode, &target).await;
        guard.finished = true;

        match result {
            Ok(mut report) => {
                report.duration_ms = started.elapsed().as_millis() as u64;
                if mode == CycleMode::FullRebuild {
                    self.force_full.store(false, Ordering::SeqCst);
                }
                info!(
                    "Refresh cycle finished in {}ms: generation {}, {} pulled, {} embedded, {} stale",
                    report.duration_ms,
                    report.generation,
                    report.pulled,
                    report.embedded,
                    report.stale.len()
                );
                *self
                    .last_report
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
                self.set_last_error(None);
                Ok(report)
            }
            Err(err) => {
                error!("Refresh cycle failed: {}", err);
                self.set_last_error(Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn cycle(&self, mode: CycleMode, target: &str) -> Result<CycleReport, RefreshError> {
        let generator = self
            .models
            .get(target)
            .ok_or_else(|| RefreshError::ModelUnavailable {
                model_id: target.to_string(),
            })?;
        let mut report = CycleReport::new(mode, target.to_string());

        self.set_phase(RefreshPhase::Pulling);
        let pulled = self.pull(mode, &mut report).await?;

        // The stored cursor is past these changes now, so an incremental
        // cycle can no longer replay them.
        let result = self
            .embed_and_publish(mode, target, &generator, pulled, &mut report)
            .await;
        if result.is_err() {
            self.force_full.store(true, Ordering::SeqCst);
        }
        report.generation = result?;

        if mode == CycleMode::Incremental && self.index.needs_retrain() {
            info!("Index outgrew its centroids, scheduling a rebuild");
            if let Err(err) = self.trigger(RefreshTask::full_rebuild(TaskPriority::High, "retrain")) {
                warn!("Could not schedule retraining: {}", err);
            }
        }
        Ok(report)
    }

    async fn embed_and_publish(
        &self,
        mode: CycleMode,
        target: &str,
        generator: &EmbeddingGenerator,
        pulled: Pulled,
        report: &mut CycleReport,
    ) -> Result<u64, RefreshError> {
        if mode == CycleMode::FullRebuild {
            report.discarded = self.discard_corrupt(generator, target).await?;
        }

        self.set_phase(RefreshPhase::Embedding);
        let embedded = self.embed_pending(generator, target, report).await?;

        self.set_phase(RefreshPhase::Publishing);
        match mode {
            CycleMode::FullRebuild => {
                let entries = self.store.load_embeddings(target).await?;
                let generation = self.index.rebuild(entries, generator.descriptor())?;
                self.store.set_current_model(target).await?;
                self.models.set_current(target);
                Ok(generation)
            }
            CycleMode::Incremental => {
                let mut touched = pulled.touched;
                touched.extend(embedded);
                self.publish_incremental(touched, target).await
            }
        }
    }

    /// Pull changes, apply them to the corpus and advance the cursor.
    async fn pull(&self, mode: CycleMode, report: &mut CycleReport) -> Result<Pulled, RefreshError> {
        let since = match mode {
            CycleMode::Incremental => self.store.cursor().await?,
            CycleMode::FullRebuild => None,
        };
        let batch = self.ingestor.pull(since).await?;
        report.pulled = batch.pulled;
        report.cursor = batch.next_cursor;

        let mut touched: BTreeSet<String> =
            batch.changes.iter().map(|c| c.id().to_string()).collect();
        let outcomes = self.store.apply_changes(&batch.changes).await?;
        report.count(&outcomes);

        if batch.full_snapshot {
            // Ids that failed to normalize are still in the archive.
            let mut live: HashSet<&str> = touched.iter().map(String::as_str).collect();
            if let Some(partial) = &batch.partial {
                live.extend(partial.failures.iter().filter_map(|f| f.id.as_deref()));
            }
            let gone: Vec<RecordChange> = self
                .store
                .record_ids()
                .await?
                .into_iter()
                .filter(|id| !live.contains(id.as_str()))
                .map(|id| RecordChange::Delete { id })
                .collect();
            if !gone.is_empty() {
                info!("Removing {} records no longer in the archive", gone.len());
                let outcomes = self.store.apply_changes(&gone).await?;
                report.count(&outcomes);
                touched.extend(gone.into_iter().map(|c| c.id().to_string()));
            }
        }

        self.store.set_cursor(batch.next_cursor).await?;
        report.partial = batch.partial;
        Ok(Pulled { touched })
    }

    /// Remove stored vectors that could never be published so they get
    /// embedded again.
    async fn discard_corrupt(
        &self,
        generator: &EmbeddingGenerator,
        target: &str,
    ) -> Result<usize, RefreshError> {
        let corrupt: Vec<String> = self
            .store
            .load_embeddings(target)
            .await?
            .into_iter()
            .filter(|e| !is_publishable(e, generator.dimension()))
            .map(|e| e.record_id)
            .collect();
        if corrupt.is_empty() {
            return Ok(0);
        }
        warn!(
            "Discarding {} corrupt stored embeddings for {}",
            corrupt.len(),
            target
        );
        Ok(self.store.delete_embeddings(target, &corrupt).await?)
    }

    /// Embed every record whose embedding is missing or outdated, one
    /// concurrent batch per shard. Returns the ids that were embedded.
    async fn embed_pending(
        &self,
        generator: &EmbeddingGenerator,
        target: &str,
        report: &mut CycleReport,
    ) -> Result<Vec<String>, RefreshError> {
        let pending = self.store.records_needing_embedding(target).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Embedding {} pending records", pending.len());

        let shard_count = self.index.shard_count();
        let mut shards: Vec<Vec<((String, TextHash), String)>> = vec![Vec::new(); shard_count];
        for record in pending {
            shards[shard_for(&record.id, shard_count)]
                .push(((record.id, record.text_hash), record.text));
        }

        let outcomes = join_all(
            shards
                .into_iter()
                .filter(|items| !items.is_empty())
                .map(|items| generator.embed_batch(items, EmbedRole::Document)),
        )
        .await;

        let mut embedded = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            embedded.extend(
                outcome
                    .embedded
                    .into_iter()
                    .map(|((id, hash), vector)| (id, hash, vector)),
            );
            failed.extend(
                outcome
                    .failed
                    .into_iter()
                    .map(|((id, _), err)| (id, err.to_string())),
            );
        }

        report.embedded = self.store.store_embeddings(target, &embedded).await?;
        if !failed.is_empty() {
            for (id, err) in &failed {
                warn!("Embedding failed for record {}: {}", id, err);
            }
            self.store.mark_stale(target, &failed).await?;
            report.stale = failed.into_iter().map(|(id, _)| id).collect();
            report.stale.sort();
        }
        Ok(embedded.into_iter().map(|(id, _, _)| id).collect())
    }

    /// Publish the current stored state of `ids` as one new generation.
    async fn publish_incremental(
        &self,
        ids: BTreeSet<String>,
        target: &str,
    ) -> Result<u64, RefreshError> {
        if ids.is_empty() {
            return Ok(self.index.snapshot().number());
        }
        let mut ops = Vec::with_capacity(ids.len());
        for id in ids {
            ops.push(match self.store.get_embedding(&id, target).await? {
                Some(embedding) => IndexOp::from(embedding),
                None => IndexOp::Delete { id },
            });
        }
        Ok(self.index.apply(ops)?)
    }

    /// Run cycles until `shutdown` fires. Timer ticks and archive
    /// notifications are queued as triggers; a cycle in flight when shutdown
    /// arrives is cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: ShutdownSignal,
        notifications: Option<flume::Receiver<()>>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Refresh scheduler started, interval {:?}", self.interval);

        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.submit_quietly(RefreshTask::incremental(TaskPriority::Background, "interval"));
                    continue;
                }
                Some(()) = next_notification(notifications.as_ref()) => {
                    self.submit_quietly(RefreshTask::incremental(TaskPriority::Normal, "archive changed"));
                    continue;
                }
                task = self.queue.next() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            debug!("Running refresh task: {}", task.description());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.run_cycle(task.mode) => {}
            }
        }

        self.queue.close();
        info!("Refresh scheduler stopped");
    }

    fn submit_quietly(&self, task: RefreshTask) {
        if let Err(err) = self.trigger(task) {
            debug!("Refresh trigger dropped: {}", err);
        }
    }
}

async fn next_notification(notifications: Option<&flume::Receiver<()>>) -> Option<()> {
    match notifications {
        Some(rx) => rx.recv_async().await.ok(),
        None => std::future::pending().await,
    }
}

fn is_publishable(embedding: &StoredEmbedding, dimension: usize) -> bool {
    embedding.vector.len() == dimension
        && embedding.vector.iter().all(|x| x.is_finite())
        && embedding.vector.iter().any(|x| *x != 0.0)
}
