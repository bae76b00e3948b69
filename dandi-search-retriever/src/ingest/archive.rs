//! Archive adapters.
//!
//! An archive exposes three reads: the full record listing, a single record
//! by id, and a change feed after a cursor. Documents are returned raw; the
//! ingestor normalizes them.

use async_trait::async_trait;
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ArchiveError;
use crate::record::ChangeCursor;

/// Every record the archive currently holds, and the cursor it corresponds to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSnapshot {
    pub records: Vec<Value>,
    #[serde(default)]
    pub cursor: ChangeCursor,
}

/// A raw change as published by the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RawChange {
    Upsert { record: Value },
    Delete { id: String },
}

/// A change together with its position in the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorChange {
    pub cursor: ChangeCursor,
    #[serde(flatten)]
    pub change: RawChange,
}

/// Changes after some cursor, in feed order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeed {
    pub changes: Vec<RawChange>,
    pub next_cursor: ChangeCursor,
}

#[async_trait]
pub trait Archive: Send + Sync {
    fn name(&self) -> &str;

    async fn snapshot(&self) -> Result<ArchiveSnapshot, ArchiveError>;

    async fn get_record(&self, id: &str) -> Result<Option<Value>, ArchiveError>;

    async fn changes_since(&self, cursor: ChangeCursor) -> Result<ChangeFeed, ArchiveError>;

    /// A channel that receives a message whenever the archive may have new
    /// changes. Archives that cannot notify return `None` and are polled.
    fn watch(&self) -> Result<Option<flume::Receiver<()>>, ArchiveError> {
        Ok(None)
    }
}

/// Whether a raw document carries `id`, either verbatim or after a
/// `PREFIX:` namespace.
fn raw_id_matches(record: &Value, id: &str) -> bool {
    ["identifier", "id"].iter().any(|field| {
        record.get(*field).and_then(Value::as_str).is_some_and(|raw| {
            raw == id || raw.rsplit_once(':').is_some_and(|(_, bare)| bare == id)
        })
    })
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<String, Value>,
    log: Vec<CursorChange>,
    cursor: u64,
    pending_failures: u32,
    watchers: Vec<flume::Sender<()>>,
}

impl MemoryState {
    fn take_failure(&mut self) -> Result<(), ArchiveError> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(ArchiveError::transient("injected failure"));
        }
        Ok(())
    }

    fn record(&mut self, change: RawChange) -> ChangeCursor {
        self.cursor += 1;
        let cursor = ChangeCursor(self.cursor);
        self.log.push(CursorChange { cursor, change });
        self.watchers
            .retain(|tx| !matches!(tx.try_send(()), Err(flume::TrySendError::Disconnected(_))));
        cursor
    }
}

/// In-process archive with a change log.
#[derive(Default)]
pub struct MemoryArchive {
    state: Mutex<MemoryState>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert(&self, id: impl Into<String>, record: Value) -> ChangeCursor {
        let mut state = self.state();
        state.records.insert(id.into(), record.clone());
        state.record(RawChange::Upsert { record })
    }

    pub fn delete(&self, id: impl Into<String>) -> ChangeCursor {
        let id = id.into();
        let mut state = self.state();
        state.records.remove(&id);
        state.record(RawChange::Delete { id })
    }

    /// Make the next `count` reads fail with a transient error.
    pub fn inject_failures(&self, count: u32) {
        self.state().pending_failures = count;
    }

    pub fn cursor(&self) -> ChangeCursor {
        ChangeCursor(self.state().cursor)
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    fn name(&self) -> &str {
        "memory"
    }

    async fn snapshot(&self) -> Result<ArchiveSnapshot, ArchiveError> {
        let mut state = self.state();
        state.take_failure()?;
        Ok(ArchiveSnapshot {
            records: state.records.values().cloned().collect(),
            cursor: ChangeCursor(state.cursor),
        })
    }

    async fn get_record(&self, id: &str) -> Result<Option<Value>, ArchiveError> {
        let mut state = self.state();
        state.take_failure()?;
        if let Some(record) = state.records.get(id) {
            return Ok(Some(record.clone()));
        }
        Ok(state
            .records
            .values()
            .find(|record| raw_id_matches(record, id))
            .cloned())
    }

    async fn changes_since(&self, cursor: ChangeCursor) -> Result<ChangeFeed, ArchiveError> {
        let mut state = self.state();
        state.take_failure()?;
        Ok(ChangeFeed {
            changes: state
                .log
                .iter()
                .filter(|c| c.cursor > cursor)
                .map(|c| c.change.clone())
                .collect(),
            next_cursor: ChangeCursor(state.cursor).max(cursor),
        })
    }

    fn watch(&self) -> Result<Option<flume::Receiver<()>>, ArchiveError> {
        let (tx, rx) = flume::bounded(1);
        self.state().watchers.push(tx);
        Ok(Some(rx))
    }
}

/// On-disk layout read by [`FileArchive`].
#[derive(Debug, Default, Deserialize)]
struct ArchiveFile {
    #[serde(default)]
    cursor: ChangeCursor,
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default)]
    changes: Vec<CursorChange>,
}

impl ArchiveFile {
    fn latest_cursor(&self) -> ChangeCursor {
        self.changes
            .iter()
            .map(|c| c.cursor)
            .max()
            .unwrap_or_default()
            .max(self.cursor)
    }
}

/// Archive backed by a JSON file:
///
/// ```json
/// {
///   "cursor": 2,
///   "records": [{"identifier": "DANDI:000001", "version": "draft", "name": "..."}],
///   "changes": [{"cursor": 2, "op": "delete", "id": "DANDI:000002"}]
/// }
/// ```
pub struct FileArchive {
    path: PathBuf,
    debounce: Duration,
    watcher: Mutex<Option<Debouncer<notify::RecommendedWatcher>>>,
}

impl FileArchive {
    pub fn new(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            path: path.into(),
            debounce,
            watcher: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<ArchiveFile, ArchiveError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        serde_json::from_str(&text).map_err(|e| {
            ArchiveError::permanent(format!("malformed archive {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl Archive for FileArchive {
    fn name(&self) -> &str {
        "file"
    }

    async fn snapshot(&self) -> Result<ArchiveSnapshot, ArchiveError> {
        let file = self.load().await?;
        let cursor = file.latest_cursor();
        Ok(ArchiveSnapshot {
            records: file.records,
            cursor,
        })
    }

    async fn get_record(&self, id: &str) -> Result<Option<Value>, ArchiveError> {
        let file = self.load().await?;
        Ok(file.records.into_iter().find(|r| raw_id_matches(r, id)))
    }

    async fn changes_since(&self, cursor: ChangeCursor) -> Result<ChangeFeed, ArchiveError> {
        let file = self.load().await?;
        let next_cursor = file.latest_cursor().max(cursor);
        let mut changes: Vec<CursorChange> = file
            .changes
            .into_iter()
            .filter(|c| c.cursor > cursor)
            .collect();
        changes.sort_by_key(|c| c.cursor);
        Ok(ChangeFeed {
            changes: changes.into_iter().map(|c| c.change).collect(),
            next_cursor,
        })
    }

    fn watch(&self) -> Result<Option<flume::Receiver<()>>, ArchiveError> {
        let (tx, rx) = flume::bounded(1);
        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut debouncer = new_debouncer(self.debounce, move |res: DebounceEventResult| {
            match res {
                Ok(events) => {
                    if events
                        .iter()
                        .any(|e| e.path.file_name().map(|n| n.to_os_string()) == file_name)
                    {
                        // A full channel already carries a pending notification.
                        let _ = tx.try_send(());
                    }
                }
                Err(err) => warn!("Archive watcher error: {}", err),
            }
        })
        .map_err(|e| ArchiveError::permanent(format!("cannot watch archive file: {e}")))?;

        debouncer
            .watcher()
            .watch(&parent, notify::RecursiveMode::NonRecursive)
            .map_err(|e| ArchiveError::permanent(format!("cannot watch {}: {e}", parent.display())))?;
        debug!("Watching {} for archive changes", self.path.display());

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(debouncer);
        Ok(Some(rx))
    }
}

/// Archive served over HTTP as JSON:
///
/// - `GET {base}/records` returns an [`ArchiveSnapshot`]
/// - `GET {base}/records/{id}` returns one raw record, or 404
/// - `GET {base}/changes?since=N` returns a [`ChangeFeed`]
pub struct HttpArchive {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArchive {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ArchiveError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl Archive for HttpArchive {
    fn name(&self) -> &str {
        "http"
    }

    async fn snapshot(&self) -> Result<ArchiveSnapshot, ArchiveError> {
        let response = self
            .client
            .get(self.url("records"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn get_record(&self, id: &str) -> Result<Option<Value>, ArchiveError> {
        let response = self
            .client
            .get(self.url(&format!("records/{id}")))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn changes_since(&self, cursor: ChangeCursor) -> Result<ChangeFeed, ArchiveError> {
        let response = self
            .client
            .get(self.url("changes"))
            .query(&[("since", cursor.0)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_archive_feed() {
        let archive = MemoryArchive::new();
        let first = archive.upsert("1", json!({"id": "1"}));
        archive.upsert("2", json!({"id": "2"}));
        archive.delete("1");

        let snapshot = archive.snapshot().await.unwrap();
        assert_eq!(snapshot.records, vec![json!({"id": "2"})]);
        assert_eq!(snapshot.cursor, ChangeCursor(3));

        let feed = archive.changes_since(first).await.unwrap();
        assert_eq!(feed.changes.len(), 2);
        assert_eq!(feed.changes[1], RawChange::Delete { id: "1".into() });
        assert_eq!(feed.next_cursor, ChangeCursor(3));

        let empty = archive.changes_since(ChangeCursor(3)).await.unwrap();
        assert!(empty.changes.is_empty());
    }

    #[tokio::test]
    async fn test_memory_archive_injected_failures() {
        let archive = MemoryArchive::new();
        archive.inject_failures(1);
        assert!(archive.snapshot().await.unwrap_err().is_transient());
        assert!(archive.snapshot().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_archive_notifies_watchers() {
        let archive = MemoryArchive::new();
        let rx = archive.watch().unwrap().unwrap();
        archive.upsert("1", json!({"id": "1"}));
        archive.upsert("2", json!({"id": "2"}));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_get_record_matches_prefixed_ids() {
        let archive = MemoryArchive::new();
        archive.upsert("DANDI:000001", json!({"identifier": "DANDI:000001"}));
        assert!(archive.get_record("000001").await.unwrap().is_some());
        assert!(archive.get_record("000002").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_archive_reads_snapshot_and_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.json");
        std::fs::write(
            &path,
            json!({
                "cursor": 1,
                "records": [{"identifier": "DANDI:000001", "version": "1", "name": "a"}],
                "changes": [
                    {"cursor": 3, "op": "delete", "id": "DANDI:000002"},
                    {"cursor": 2, "op": "upsert", "record": {"identifier": "DANDI:000001"}}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let archive = FileArchive::new(&path, Duration::from_millis(50));
        let snapshot = archive.snapshot().await.unwrap();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.cursor, ChangeCursor(3));

        let feed = archive.changes_since(ChangeCursor(1)).await.unwrap();
        assert!(matches!(feed.changes[0], RawChange::Upsert { .. }));
        assert_eq!(
            feed.changes[1],
            RawChange::Delete {
                id: "DANDI:000002".into()
            }
        );
        assert_eq!(feed.next_cursor, ChangeCursor(3));

        assert!(archive.get_record("000001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_archive_errors_are_classified() {
        let dir = tempdir().unwrap();
        let missing = FileArchive::new(dir.path().join("nope.json"), Duration::from_millis(50));
        assert!(!missing.snapshot().await.unwrap_err().is_transient());

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let malformed = FileArchive::new(&path, Duration::from_millis(50));
        assert!(matches!(
            malformed.snapshot().await,
            Err(ArchiveError::Permanent { .. })
        ));
    }

    #[test]
    fn test_http_archive_urls() {
        let archive = HttpArchive::new("https://archive.example.org/api/", Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            archive.url("records"),
            "https://archive.example.org/api/records"
        );
    }
}
