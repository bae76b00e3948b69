//! SQLite implementation of the corpus store
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE records (
//!     id TEXT PRIMARY KEY,
//!     version TEXT NOT NULL,
//!     text TEXT NOT NULL,
//!     text_hash BLOB NOT NULL,        -- blake3 of text (32 bytes)
//!     payload_json TEXT NOT NULL,
//!     updated_at TIMESTAMP NOT NULL
//! );
//!
//! CREATE TABLE embeddings (
//!     record_id TEXT REFERENCES records(id) ON DELETE CASCADE,
//!     model_id TEXT NOT NULL,
//!     text_hash BLOB NOT NULL,        -- hash of the text that was embedded
//!     vector BLOB NOT NULL,           -- little-endian f32 components
//!     embedded_at TIMESTAMP NOT NULL,
//!     PRIMARY KEY (record_id, model_id)
//! );
//! ```
//!
//! plus `stale_embeddings`, `embedding_models` and the `ingest_state`
//! key/value table holding the change cursor.
//!
//! ## SQLite Optimizations
//!
//! - **WAL mode**: readers do not block the refresh writer
//! - **Large page size** (64KB): embedding blobs stay on few pages
//! - **Foreign keys**: embeddings and stale marks die with their record

use super::{
    ApplyOutcome, CorpusStore, ModelRow, PendingRecord, StaleMark, StoredEmbedding,
};
use crate::record::{ChangeCursor, Payload, Record, RecordChange, TextHash};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dandi_search_embed::ModelDescriptor;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;

const CURSOR_KEY: &str = "change_cursor";

/// SQLite-based corpus store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens the store backed by a database file, creating it if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(path)
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .busy_timeout(std::time::Duration::from_secs(5))
                    .foreign_keys(true)
                    .create_if_missing(true)
                    .page_size(1 << 16),
            )
            .await
            .with_context(|| format!("opening corpus database {}", path.display()))?;
        Self::new_with_pool(pool).await
    }

    /// Opens a store with in-memory SQLite storage. Each in-memory connection
    /// is its own database, so the pool holds exactly one.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                text TEXT NOT NULL,
                text_hash BLOB NOT NULL,
                payload_json TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_models (
                model_id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                model_name TEXT NOT NULL,
                model_version TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                is_current BOOLEAN NOT NULL DEFAULT 0,
                registered_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                record_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                text_hash BLOB NOT NULL,
                vector BLOB NOT NULL,
                embedded_at TIMESTAMP NOT NULL,
                PRIMARY KEY (record_id, model_id),
                FOREIGN KEY (record_id) REFERENCES records(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stale_embeddings (
                record_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                marked_at TIMESTAMP NOT NULL,
                PRIMARY KEY (record_id, model_id),
                FOREIGN KEY (record_id) REFERENCES records(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    async fn apply_one(
        tx: &mut Transaction<'_, Sqlite>,
        change: &RecordChange,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        match change {
            RecordChange::Upsert(record) => {
                let payload_json = serde_json::to_string(&record.payload)?;
                let hash = record.text_hash();
                let existing = sqlx::query(
                    "SELECT version, text_hash, payload_json FROM records WHERE id = ?",
                )
                .bind(&record.id)
                .fetch_optional(&mut **tx)
                .await?;

                match existing {
                    None => {
                        sqlx::query(
                            "INSERT INTO records (id, version, text, text_hash, payload_json, updated_at)
                             VALUES (?, ?, ?, ?, ?, ?)",
                        )
                        .bind(&record.id)
                        .bind(&record.version)
                        .bind(&record.text)
                        .bind(&hash[..])
                        .bind(&payload_json)
                        .bind(now)
                        .execute(&mut **tx)
                        .await?;
                        Ok(ApplyOutcome::Inserted)
                    }
                    Some(row) => {
                        let version: String = row.get("version");
                        let stored_hash: Vec<u8> = row.get("text_hash");
                        let stored_payload: String = row.get("payload_json");
                        if version == record.version
                            && stored_hash == hash
                            && stored_payload == payload_json
                        {
                            return Ok(ApplyOutcome::Unchanged);
                        }
                        sqlx::query(
                            "UPDATE records
                             SET version = ?, text = ?, text_hash = ?, payload_json = ?, updated_at = ?
                             WHERE id = ?",
                        )
                        .bind(&record.version)
                        .bind(&record.text)
                        .bind(&hash[..])
                        .bind(&payload_json)
                        .bind(now)
                        .bind(&record.id)
                        .execute(&mut **tx)
                        .await?;
                        Ok(ApplyOutcome::Updated)
                    }
                }
            }
            RecordChange::Delete { id } => {
                sqlx::query("DELETE FROM embeddings WHERE record_id = ?")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
                sqlx::query("DELETE FROM stale_embeddings WHERE record_id = ?")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
                let deleted = sqlx::query("DELETE FROM records WHERE id = ?")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
                Ok(if deleted > 0 {
                    ApplyOutcome::Deleted
                } else {
                    ApplyOutcome::Missing
                })
            }
        }
    }
}

fn encode_vector(vector: &[f32]) -> &[u8] {
    bytemuck::cast_slice(vector)
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % std::mem::size_of::<f32>() != 0 {
        bail!("embedding blob has invalid length {}", bytes.len());
    }
    Ok(bytemuck::pod_collect_to_vec::<u8, f32>(bytes))
}

fn decode_hash(bytes: Vec<u8>) -> Result<TextHash> {
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("text hash has invalid length {}", b.len()))
}

fn decode_payload(json: &str) -> Result<Payload> {
    Ok(serde_json::from_str(json)?)
}

fn row_to_embedding(row: &SqliteRow) -> Result<StoredEmbedding> {
    let record_id: String = row.get("record_id");
    let bytes: Vec<u8> = row.get("vector");
    let payload_json: String = row.get("payload_json");
    Ok(StoredEmbedding {
        vector: decode_vector(&bytes)
            .with_context(|| format!("decoding embedding for {record_id}"))?,
        payload: decode_payload(&payload_json)?,
        record_id,
    })
}

#[async_trait]
impl CorpusStore for SqliteStore {
    async fn apply_changes(&self, changes: &[RecordChange]) -> Result<Vec<ApplyOutcome>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(changes.len());
        for change in changes {
            outcomes.push(Self::apply_one(&mut tx, change, now).await?);
        }
        tx.commit().await?;
        Ok(outcomes)
    }

    async fn get_record(&self, id: &str) -> Result<Option<Record>> {
        let row = sqlx::query("SELECT id, version, text, payload_json FROM records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let payload_json: String = row.get("payload_json");
            Ok(Record {
                id: row.get("id"),
                version: row.get("version"),
                text: row.get("text"),
                payload: decode_payload(&payload_json)?,
            })
        })
        .transpose()
    }

    async fn record_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM records ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn record_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM records")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(count as usize)
    }

    async fn records_needing_embedding(&self, model_id: &str) -> Result<Vec<PendingRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.text, r.text_hash
            FROM records r
            LEFT JOIN embeddings e ON e.record_id = r.id AND e.model_id = ?
            WHERE e.record_id IS NULL OR e.text_hash != r.text_hash
            ORDER BY r.id
            "#,
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(PendingRecord {
                    id: row.get("id"),
                    text: row.get("text"),
                    text_hash: decode_hash(row.get("text_hash"))?,
                })
            })
            .collect()
    }

    async fn store_embeddings(
        &self,
        model_id: &str,
        embeddings: &[(String, TextHash, Vec<f32>)],
    ) -> Result<usize> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut stored = 0;
        for (record_id, hash, vector) in embeddings {
            let written = sqlx::query(
                r#"
                INSERT INTO embeddings (record_id, model_id, text_hash, vector, embedded_at)
                SELECT id, ?, text_hash, ?, ? FROM records WHERE id = ? AND text_hash = ?
                ON CONFLICT(record_id, model_id) DO UPDATE SET
                    text_hash = excluded.text_hash,
                    vector = excluded.vector,
                    embedded_at = excluded.embedded_at
                "#,
            )
            .bind(model_id)
            .bind(encode_vector(vector))
            .bind(now)
            .bind(record_id)
            .bind(&hash[..])
            .execute(&mut *tx)
            .await?
            .rows_affected();
            stored += written as usize;

            sqlx::query("DELETE FROM stale_embeddings WHERE record_id = ? AND model_id = ?")
                .bind(record_id)
                .bind(model_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::debug!("Stored {} embeddings for {}", stored, model_id);
        Ok(stored)
    }

    async fn get_embedding(
        &self,
        record_id: &str,
        model_id: &str,
    ) -> Result<Option<StoredEmbedding>> {
        let row = sqlx::query(
            r#"
            SELECT e.record_id, e.vector, r.payload_json
            FROM embeddings e JOIN records r ON r.id = e.record_id
            WHERE e.record_id = ? AND e.model_id = ?
            "#,
        )
        .bind(record_id)
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_embedding).transpose()
    }

    async fn load_embeddings(&self, model_id: &str) -> Result<Vec<StoredEmbedding>> {
        let rows = sqlx::query(
            r#"
            SELECT e.record_id, e.vector, r.payload_json
            FROM embeddings e JOIN records r ON r.id = e.record_id
            WHERE e.model_id = ?
            ORDER BY e.record_id
            "#,
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_embedding).collect()
    }

    async fn embedding_count(&self, model_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM embeddings WHERE model_id = ?")
            .bind(model_id)
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(count as usize)
    }

    async fn delete_embeddings(&self, model_id: &str, record_ids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for record_id in record_ids {
            deleted += sqlx::query("DELETE FROM embeddings WHERE record_id = ? AND model_id = ?")
                .bind(record_id)
                .bind(model_id)
                .execute(&mut *tx)
                .await?
                .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn mark_stale(&self, model_id: &str, failures: &[(String, String)]) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for (record_id, error) in failures {
            sqlx::query(
                r#"
                INSERT INTO stale_embeddings (record_id, model_id, attempts, last_error, marked_at)
                SELECT id, ?, 1, ?, ? FROM records WHERE id = ?
                ON CONFLICT(record_id, model_id) DO UPDATE SET
                    attempts = stale_embeddings.attempts + 1,
                    last_error = excluded.last_error,
                    marked_at = excluded.marked_at
                "#,
            )
            .bind(model_id)
            .bind(error)
            .bind(now)
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn stale_marks(&self, model_id: &str) -> Result<Vec<StaleMark>> {
        let rows = sqlx::query(
            "SELECT record_id, model_id, attempts, last_error, marked_at
             FROM stale_embeddings WHERE model_id = ? ORDER BY record_id",
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| StaleMark {
                record_id: row.get("record_id"),
                model_id: row.get("model_id"),
                attempts: row.get::<i64, _>("attempts") as u32,
                last_error: row.get("last_error"),
                marked_at: row.get("marked_at"),
            })
            .collect())
    }

    async fn cursor(&self) -> Result<Option<ChangeCursor>> {
        let row = sqlx::query("SELECT value FROM ingest_state WHERE key = ?")
            .bind(CURSOR_KEY)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let value: String = row.get("value");
            value
                .parse::<u64>()
                .map(ChangeCursor)
                .with_context(|| format!("invalid stored cursor {value:?}"))
        })
        .transpose()
    }

    async fn set_cursor(&self, cursor: ChangeCursor) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingest_state (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(CURSOR_KEY)
        .bind(cursor.0.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn register_model(&self, descriptor: &ModelDescriptor) -> Result<()> {
        sqlx::query(
            "INSERT INTO embedding_models
                (model_id, provider, model_name, model_version, dimension, is_current, registered_at)
             VALUES (?, ?, ?, ?, ?, 0, ?)
             ON CONFLICT(model_id) DO NOTHING",
        )
        .bind(descriptor.model_id())
        .bind(&descriptor.provider)
        .bind(&descriptor.model_name)
        .bind(&descriptor.model_version)
        .bind(descriptor.dimension as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_current_model(&self, model_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let known = sqlx::query("SELECT 1 FROM embedding_models WHERE model_id = ?")
            .bind(model_id)
            .fetch_optional(&mut *tx)
            .await?;
        if known.is_none() {
            bail!("embedding model {model_id} is not registered");
        }
        sqlx::query(
            "UPDATE embedding_models SET is_current = CASE WHEN model_id = ? THEN 1 ELSE 0 END",
        )
        .bind(model_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn models(&self) -> Result<Vec<ModelRow>> {
        let rows = sqlx::query(
            "SELECT provider, model_name, model_version, dimension, is_current, registered_at
             FROM embedding_models ORDER BY registered_at, model_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| ModelRow {
                descriptor: ModelDescriptor::new(
                    row.get::<String, _>("provider"),
                    row.get::<String, _>("model_name"),
                    row.get::<String, _>("model_version"),
                    row.get::<i64, _>("dimension") as usize,
                ),
                is_current: row.get("is_current"),
                registered_at: row.get("registered_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const MODEL: &str = "hashing:test:1:3";

    fn record(id: &str, version: &str, text: &str) -> Record {
        Record::new(id, version, text)
    }

    fn upsert(r: Record) -> RecordChange {
        RecordChange::Upsert(r)
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        let batch = vec![
            upsert(record("a", "1", "olfactory bulb")),
            upsert(record("b", "1", "visual cortex")),
            RecordChange::Delete { id: "zzz".into() },
        ];

        let first = store.apply_changes(&batch).await?;
        assert_eq!(
            first,
            vec![
                ApplyOutcome::Inserted,
                ApplyOutcome::Inserted,
                ApplyOutcome::Missing
            ]
        );

        let second = store.apply_changes(&batch).await?;
        assert_eq!(
            second,
            vec![
                ApplyOutcome::Unchanged,
                ApplyOutcome::Unchanged,
                ApplyOutcome::Missing
            ]
        );
        assert_eq!(store.record_ids().await?, vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_replaces_text_and_payload() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        store
            .apply_changes(&[upsert(record("a", "1", "old text"))])
            .await?;

        let mut payload = Payload::new();
        payload.insert("category".into(), json!("ephys"));
        let updated = record("a", "2", "new text").with_payload(payload.clone());
        assert_eq!(
            store.apply_changes(&[upsert(updated)]).await?,
            vec![ApplyOutcome::Updated]
        );

        let stored = store.get_record("a").await?.unwrap();
        assert_eq!(stored.version, "2");
        assert_eq!(stored.text, "new text");
        assert_eq!(stored.payload, payload);
        assert_eq!(store.record_count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_embedding_lifecycle() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        let a = record("a", "1", "olfactory bulb");
        let b = record("b", "1", "visual cortex");
        store
            .apply_changes(&[upsert(a.clone()), upsert(b.clone())])
            .await?;

        let pending = store.records_needing_embedding(MODEL).await?;
        assert_eq!(pending.len(), 2);

        let stored = store
            .store_embeddings(
                MODEL,
                &[
                    ("a".into(), a.text_hash(), vec![1.0, 0.0, 0.0]),
                    ("b".into(), b.text_hash(), vec![0.0, 1.0, 0.0]),
                ],
            )
            .await?;
        assert_eq!(stored, 2);
        assert!(store.records_needing_embedding(MODEL).await?.is_empty());

        // Changing the text makes the embedding pending again but it keeps serving.
        store
            .apply_changes(&[upsert(record("a", "2", "olfactory cortex"))])
            .await?;
        let pending = store.records_needing_embedding(MODEL).await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "a");
        assert_eq!(store.load_embeddings(MODEL).await?.len(), 2);

        // An embedding computed from the old text is not stored.
        let stale_write = store
            .store_embeddings(MODEL, &[("a".into(), a.text_hash(), vec![0.5, 0.5, 0.0])])
            .await?;
        assert_eq!(stale_write, 0);

        let loaded = store.get_embedding("b", MODEL).await?.unwrap();
        assert_eq!(loaded.vector, vec![0.0, 1.0, 0.0]);

        store
            .apply_changes(&[RecordChange::Delete { id: "b".into() }])
            .await?;
        assert!(store.get_embedding("b", MODEL).await?.is_none());
        assert_eq!(store.embedding_count(MODEL).await?, 1);

        assert_eq!(store.delete_embeddings(MODEL, &["a".to_string()]).await?, 1);
        assert_eq!(store.records_needing_embedding(MODEL).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_marks() -> Result<()> {
        let store = SqliteStore::open_memory().await?;
        let a = record("a", "1", "olfactory bulb");
        store.apply_changes(&[upsert(a.clone())]).await?;

        let failure = vec![("a".to_string(), "timeout".to_string())];
        store.mark_stale(MODEL, &failure).await?;
        store.mark_stale(MODEL, &failure).await?;
        // Unknown ids are ignored.
        store
            .mark_stale(MODEL, &[("ghost".to_string(), "x".to_string())])
            .await?;

        let marks = store.stale_marks(MODEL).await?;
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].attempts, 2);
        assert_eq!(marks[0].last_error, "timeout");

        store
            .store_embeddings(MODEL, &[("a".into(), a.text_hash(), vec![1.0, 0.0, 0.0])])
            .await?;
        assert!(store.stale_marks(MODEL).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cursor_and_models_persist() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("corpus.db");
        let descriptor = ModelDescriptor::new("hashing", "fnv", "1", 64);
        {
            let store = SqliteStore::open(&path).await?;
            assert_eq!(store.cursor().await?, None);
            store.set_cursor(ChangeCursor(42)).await?;
            store.register_model(&descriptor).await?;
            store.register_model(&descriptor).await?;
            store.set_current_model(&descriptor.model_id()).await?;
        }

        let store = SqliteStore::open(&path).await?;
        assert_eq!(store.cursor().await?, Some(ChangeCursor(42)));
        let models = store.models().await?;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].descriptor, descriptor);
        assert!(models[0].is_current);
        assert!(store.set_current_model("unknown").await.is_err());
        Ok(())
    }

    #[test]
    fn test_vector_codec() {
        let vector = vec![0.25f32, -1.5, 3.0];
        let bytes = encode_vector(&vector).to_vec();
        assert_eq!(decode_vector(&bytes).unwrap(), vector);
        assert!(decode_vector(&bytes[..5]).is_err());
    }
}
