//! Pulls raw documents from an [`Archive`] and normalizes them into record
//! changes.

use dandi_search_embed::RetryPolicy;
use dandi_search_text::RecordNormalizer;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::archive::{Archive, RawChange};
use crate::error::{ArchiveError, IngestFailure, PartialIngestionError};
use crate::record::{ChangeCursor, Record, RecordChange};

/// Normalized changes from one pull.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestBatch {
    /// At most one change per id, in first-seen order.
    pub changes: Vec<RecordChange>,
    pub next_cursor: ChangeCursor,
    /// The batch holds every record the archive has, so ids missing from it
    /// are gone from the archive.
    pub full_snapshot: bool,
    /// Raw changes received before normalization
    pub pulled: usize,
    pub partial: Option<PartialIngestionError>,
}

pub struct CorpusIngestor {
    archive: Arc<dyn Archive>,
    normalizer: RecordNormalizer,
    retry: RetryPolicy,
}

impl CorpusIngestor {
    pub fn new(archive: Arc<dyn Archive>, normalizer: RecordNormalizer, retry: RetryPolicy) -> Self {
        Self {
            archive,
            normalizer,
            retry,
        }
    }

    pub fn archive(&self) -> &Arc<dyn Archive> {
        &self.archive
    }

    /// Pull the full snapshot (`since = None`) or the changes after `since`.
    pub async fn pull(&self, since: Option<ChangeCursor>) -> Result<IngestBatch, ArchiveError> {
        let (raw, next_cursor, full_snapshot) = match since {
            None => {
                let snapshot = self
                    .with_retry("snapshot", || self.archive.snapshot())
                    .await?;
                let raw: Vec<RawChange> = snapshot
                    .records
                    .into_iter()
                    .map(|record| RawChange::Upsert { record })
                    .collect();
                (raw, snapshot.cursor, true)
            }
            Some(cursor) => {
                let feed = self
                    .with_retry("change feed", || self.archive.changes_since(cursor))
                    .await?;
                (feed.changes, feed.next_cursor.max(cursor), false)
            }
        };

        let pulled = raw.len();
        let (changes, failures) = self.normalize_changes(raw);
        let partial = if failures.is_empty() {
            None
        } else {
            let err = PartialIngestionError {
                attempted: pulled,
                failures,
            };
            warn!("{}", err);
            Some(err)
        };
        info!(
            "Pulled {} changes from {} archive ({} after compaction), cursor {}",
            pulled,
            self.archive.name(),
            changes.len(),
            next_cursor
        );

        Ok(IngestBatch {
            changes,
            next_cursor,
            full_snapshot,
            pulled,
            partial,
        })
    }

    /// Fetch and normalize a single record.
    pub async fn fetch(&self, id: &str) -> Result<Option<Record>, ArchiveError> {
        let raw = self
            .with_retry("record", || self.archive.get_record(id))
            .await?;
        match raw {
            None => Ok(None),
            Some(raw) => self
                .normalizer
                .normalize(&raw)
                .map(|r| Some(Record::from(r)))
                .map_err(|e| ArchiveError::permanent(format!("record {id}: {e}"))),
        }
    }

    fn normalize_changes(&self, raw: Vec<RawChange>) -> (Vec<RecordChange>, Vec<IngestFailure>) {
        let mut changes: Vec<RecordChange> = Vec::with_capacity(raw.len());
        let mut position: HashMap<String, usize> = HashMap::new();
        let mut failures = Vec::new();

        for change in raw {
            let normalized = match change {
                RawChange::Upsert { record } => match self.normalizer.normalize(&record) {
                    Ok(normalized) => RecordChange::Upsert(normalized.into()),
                    Err(err) => {
                        failures.push(self.failure(&record, err.to_string()));
                        continue;
                    }
                },
                RawChange::Delete { id } => {
                    let id = self.normalizer.normalize_id(&id);
                    if id.is_empty() {
                        failures.push(IngestFailure {
                            id: None,
                            reason: "delete without an id".into(),
                        });
                        continue;
                    }
                    RecordChange::Delete { id }
                }
            };

            match position.get(normalized.id()) {
                Some(&at) => changes[at] = normalized,
                None => {
                    position.insert(normalized.id().to_string(), changes.len());
                    changes.push(normalized);
                }
            }
        }
        (changes, failures)
    }

    fn failure(&self, record: &Value, reason: String) -> IngestFailure {
        let id = self.normalizer.extract_id(record).ok();
        warn!(
            "Skipping record {}: {}",
            id.as_deref().unwrap_or("<unknown>"),
            reason
        );
        IngestFailure { id, reason }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ArchiveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ArchiveError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        "Archive {} fetch failed (attempt {}), retrying in {:?}: {}",
                        what, attempt, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!("Archive {} fetch failed after {} attempts: {}", what, attempt, err);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::MemoryArchive;
    use dandi_search_text::NormalizerConfig;
    use serde_json::json;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn dataset(id: &str, version: &str, name: &str) -> Value {
        json!({"identifier": format!("DANDI:{id}"), "version": version, "name": name})
    }

    fn ingestor(archive: Arc<MemoryArchive>, retry: RetryPolicy) -> CorpusIngestor {
        CorpusIngestor::new(
            archive,
            RecordNormalizer::new(NormalizerConfig::default()),
            retry,
        )
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn test_full_pull_normalizes_records() {
        let archive = Arc::new(MemoryArchive::new());
        archive.upsert("1", dataset("000001", "1", "Olfactory bulb"));
        archive.upsert("2", dataset("000002", "1", "Visual cortex"));

        let batch = ingestor(archive, fast_retry(1)).pull(None).await.unwrap();
        assert!(batch.full_snapshot);
        assert_eq!(batch.pulled, 2);
        assert_eq!(batch.next_cursor, ChangeCursor(2));
        let ids: Vec<&str> = batch.changes.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["000001", "000002"]);
        assert!(batch.partial.is_none());
    }

    #[tokio::test]
    async fn test_incremental_pull_compacts_changes() {
        let archive = Arc::new(MemoryArchive::new());
        let start = archive.upsert("1", dataset("000001", "1", "first"));
        archive.upsert("1", dataset("000001", "2", "second"));
        archive.upsert("2", dataset("000002", "1", "other"));
        archive.delete("DANDI:000002");

        let batch = ingestor(archive, fast_retry(1))
            .pull(Some(start))
            .await
            .unwrap();
        assert!(!batch.full_snapshot);
        assert_eq!(batch.pulled, 3);
        assert_eq!(batch.changes.len(), 2);
        match &batch.changes[0] {
            RecordChange::Upsert(record) => assert_eq!(record.version, "2"),
            other => panic!("unexpected change {other:?}"),
        }
        assert_eq!(
            batch.changes[1],
            RecordChange::Delete {
                id: "000002".into()
            }
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_records_are_skipped() {
        let archive = Arc::new(MemoryArchive::new());
        archive.upsert("1", dataset("000001", "1", "fine"));
        archive.upsert("2", json!({"identifier": "DANDI:000002", "name": "no version"}));
        archive.upsert("3", json!("not an object"));

        let batch = ingestor(archive, fast_retry(1)).pull(None).await.unwrap();
        assert_eq!(batch.changes.len(), 1);
        let partial = batch.partial.unwrap();
        assert_eq!(partial.attempted, 3);
        assert_eq!(partial.failures.len(), 2);
        assert_eq!(partial.failures[0].id.as_deref(), Some("000002"));
        assert_eq!(partial.failures[1].id, None);
        assert!(logs_contain("2 of 3 records failed to ingest"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_transient_failures_are_retried() {
        let archive = Arc::new(MemoryArchive::new());
        archive.upsert("1", dataset("000001", "1", "fine"));
        archive.inject_failures(2);

        let batch = ingestor(archive.clone(), fast_retry(3)).pull(None).await.unwrap();
        assert_eq!(batch.changes.len(), 1);

        archive.inject_failures(5);
        let err = ingestor(archive, fast_retry(3)).pull(None).await.unwrap_err();
        assert!(err.is_transient());
        assert!(logs_contain("failed after 3 attempts"));
    }

    #[tokio::test]
    async fn test_fetch_single_record() {
        let archive = Arc::new(MemoryArchive::new());
        archive.upsert("DANDI:000001", dataset("000001", "1", "Olfactory bulb"));
        let ingestor = ingestor(archive, fast_retry(1));

        let record = ingestor.fetch("000001").await.unwrap().unwrap();
        assert_eq!(record.text, "Olfactory bulb");
        assert!(ingestor.fetch("999999").await.unwrap().is_none());
    }
}
