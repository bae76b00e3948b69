//! Core data types shared by ingestion, storage and the index.

use dandi_search_text::NormalizedRecord;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

/// Auxiliary record fields used for filtering and reranking.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Blake3 hash of a record's normalized text (32 bytes).
pub type TextHash = [u8; 32];

/// A searchable archive record. Exactly one current text exists per id;
/// a newer version replaces the stored row as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub version: String,
    pub text: String,
    #[serde(default)]
    pub payload: Payload,
}

impl Record {
    pub fn new(id: impl Into<String>, version: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            text: text.into(),
            payload: Payload::new(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn text_hash(&self) -> TextHash {
        hash_text(&self.text)
    }
}

impl From<NormalizedRecord> for Record {
    fn from(record: NormalizedRecord) -> Self {
        Self {
            id: record.id,
            version: record.version,
            text: record.text,
            payload: record.payload,
        }
    }
}

pub fn hash_text(text: &str) -> TextHash {
    blake3::hash(text.as_bytes()).into()
}

/// Position in the archive's change feed. Monotonically increasing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChangeCursor(pub u64);

impl fmt::Display for ChangeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A normalized change to apply to the corpus.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    Upsert(Record),
    Delete { id: String },
}

impl RecordChange {
    pub fn id(&self) -> &str {
        match self {
            Self::Upsert(record) => &record.id,
            Self::Delete { id } => id,
        }
    }
}

/// Shard that owns `id` among `shards` shards.
pub fn shard_for(id: &str, shards: usize) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write(id.as_bytes());
    (hasher.finish() % shards.max(1) as u64) as usize
}
