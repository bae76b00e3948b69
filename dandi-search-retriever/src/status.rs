//! Engine status reporting, shared by the CLI `status` command and the MCP
//! `status` tool.

use anyhow::Result;
use serde::Serialize;

use crate::engine::SearchEngine;
use crate::record::ChangeCursor;
use crate::refresh::{CycleReport, RefreshPhase};
use crate::storage::{ModelRow, StaleMark};

/// The generation queries are currently served from.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStatus {
    pub number: u64,
    pub model_id: String,
    pub dimension: usize,
    pub entries: usize,
    /// Zero while the generation is searched exhaustively
    pub centroids: usize,
    /// Entry count when the centroids were trained
    pub trained_entries: usize,
}

/// Corpus store counters for the serving model.
#[derive(Debug, Clone, Serialize)]
pub struct CorpusStatus {
    pub records: usize,
    pub embeddings: usize,
    /// Records with no embedding for the serving model yet
    pub pending: usize,
    pub cursor: Option<ChangeCursor>,
}

/// Refresh scheduler state.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshStatus {
    pub phase: RefreshPhase,
    pub target_model: String,
    pub full_rebuild_pending: bool,
    pub queued_tasks: usize,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub generation: GenerationStatus,
    pub corpus: CorpusStatus,
    pub refresh: RefreshStatus,
    pub stale: Vec<StaleMark>,
    pub models: Vec<ModelRow>,
}

impl EngineStatus {
    pub async fn collect(engine: &SearchEngine) -> Result<Self> {
        let snapshot = engine.index().snapshot();
        let model_id = snapshot.model_id().to_string();
        let store = engine.store();
        let scheduler = engine.scheduler();

        Ok(Self {
            generation: GenerationStatus {
                number: snapshot.number(),
                model_id: model_id.clone(),
                dimension: snapshot.dimension(),
                entries: snapshot.len(),
                centroids: snapshot.centroid_count(),
                trained_entries: snapshot.trained_count(),
            },
            corpus: CorpusStatus {
                records: store.record_count().await?,
                embeddings: store.embedding_count(&model_id).await?,
                pending: store.records_needing_embedding(&model_id).await?.len(),
                cursor: store.cursor().await?,
            },
            refresh: RefreshStatus {
                phase: scheduler.phase(),
                target_model: scheduler.target_model(),
                full_rebuild_pending: scheduler.full_rebuild_pending(),
                queued_tasks: scheduler.queue().len(),
                last_report: scheduler.last_report(),
                last_error: scheduler.last_error(),
            },
            stale: store.stale_marks(&model_id).await?,
            models: store.models().await?,
        })
    }

    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!(
                "generation {} ({}, dim {}): {} entries, {} centroids",
                self.generation.number,
                self.generation.model_id,
                self.generation.dimension,
                self.generation.entries,
                self.generation.centroids
            ),
            format!(
                "corpus: {} records, {} embeddings, {} pending, cursor {}",
                self.corpus.records,
                self.corpus.embeddings,
                self.corpus.pending,
                self.corpus
                    .cursor
                    .map(|c| c.0.to_string())
                    .unwrap_or_else(|| "none".into())
            ),
            format!(
                "refresh: {:?}, target {}, {} queued{}",
                self.refresh.phase,
                self.refresh.target_model,
                self.refresh.queued_tasks,
                if self.refresh.full_rebuild_pending {
                    ", full rebuild pending"
                } else {
                    ""
                }
            ),
        ];
        if let Some(report) = &self.refresh.last_report {
            lines.push(format!(
                "last cycle: {:?} at {}, {} pulled, {} embedded, {} stale in {}ms",
                report.mode,
                report.started_at.to_rfc3339(),
                report.pulled,
                report.embedded,
                report.stale.len(),
                report.duration_ms
            ));
        }
        if let Some(err) = &self.refresh.last_error {
            lines.push(format!("last error: {err}"));
        }
        for mark in &self.stale {
            lines.push(format!(
                "stale: {} ({} attempts): {}",
                mark.record_id, mark.attempts, mark.last_error
            ));
        }
        lines.join("\n")
    }
}
