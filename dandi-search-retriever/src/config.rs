//! Engine configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working in-process configuration:
//!
//! ```toml
//! [storage]
//! path = "dandi-search.db"
//!
//! [archive]
//! kind = "http"
//! base_url = "https://archive.example.org/api"
//!
//! [embedding]
//! provider = "fastembed"
//! model_name = "bge-small-en-v1.5"
//!
//! [index]
//! shards = 8
//!
//! [refresh]
//! interval_secs = 600
//! ```

use anyhow::{Context, Result, bail};
use dandi_search_embed::{EmbedConfig, RetryPolicy};
use dandi_search_text::NormalizerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::refresh::TaskQueueConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub archive: ArchiveConfig,
    pub normalizer: NormalizerConfig,
    pub embedding: EmbedConfig,
    pub index: IndexConfig,
    pub query: QueryConfig,
    pub refresh: RefreshConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `None` keeps the corpus in memory.
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from(".dandi-search.db")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    /// JSON snapshot file on disk
    #[default]
    File,
    /// JSON-over-HTTP archive API
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub kind: ArchiveKind,
    /// Snapshot file for `kind = "file"`
    pub path: PathBuf,
    /// Base URL for `kind = "http"`
    pub base_url: Option<String>,
    pub request_timeout_ms: u64,
    /// Watch the snapshot file and refresh when it changes
    pub watch: bool,
    pub watch_debounce_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            kind: ArchiveKind::File,
            path: PathBuf::from("archive.json"),
            base_url: None,
            request_timeout_ms: 30_000,
            watch: false,
            watch_debounce_ms: 2_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl ArchiveConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Number of shards entries are partitioned into by id hash
    pub shards: usize,
    /// Generations smaller than this are searched exhaustively
    pub exact_search_threshold: usize,
    /// Number of k-means centroids. Defaults to `sqrt(n)`.
    pub nlist: Option<usize>,
    /// Cap on inverted lists scanned per query. `None` scans until the
    /// result is provably exact.
    pub max_probe: Option<usize>,
    /// Maximum number of vectors k-means is trained on
    pub training_sample: usize,
    pub kmeans_iterations: usize,
    pub seed: u64,
    /// Retrain once the entry count exceeds the trained count by this factor
    pub retrain_growth_factor: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            shards: 8,
            exact_search_threshold: 1024,
            nlist: None,
            max_probe: None,
            training_sample: 4096,
            kmeans_iterations: 12,
            seed: 0x5eed,
            retrain_growth_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub max_query_chars: usize,
    pub timeout_ms: u64,
    /// Payload field used to order equal-score hits, newest first.
    /// Unset disables reranking.
    pub recency_field: Option<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            max_top_k: 100,
            max_query_chars: 1024,
            timeout_ms: 10_000,
            recency_field: None,
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub queue: TaskQueueConfig,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            queue: TaskQueueConfig::default(),
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl EngineConfig {
    /// Configuration with an in-memory corpus, for tests and embedding in
    /// other programs.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig { path: None },
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_embedding(mut self, embedding: EmbedConfig) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.index = index;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.embedding.validate()?;
        if self.index.shards == 0 {
            bail!("index.shards must be positive");
        }
        if self.index.retrain_growth_factor <= 1.0 {
            bail!("index.retrain_growth_factor must be greater than 1");
        }
        if self.query.default_top_k == 0 || self.query.default_top_k > self.query.max_top_k {
            bail!("query.default_top_k must be between 1 and query.max_top_k");
        }
        if self.query.max_query_chars == 0 {
            bail!("query.max_query_chars must be positive");
        }
        if self.refresh.interval_secs == 0 {
            bail!("refresh.interval_secs must be positive");
        }
        if self.archive.kind == ArchiveKind::Http && self.archive.base_url.is_none() {
            bail!("archive.base_url is required for the http archive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dandi_search_embed::ProviderKind;
    use std::io::Write;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.query.default_top_k, 10);
        assert_eq!(config.index.shards, 8);
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_toml(
            r#"
            [archive]
            kind = "http"
            base_url = "http://localhost:8080"

            [embedding]
            provider = "fastembed"
            model_name = "bge-small-en-v1.5"

            [index]
            shards = 4
            max_probe = 32

            [query]
            recency_field = "dateModified"
            "#,
        )
        .unwrap();
        assert_eq!(config.archive.kind, ArchiveKind::Http);
        assert_eq!(config.embedding.provider, ProviderKind::FastEmbed);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.index.shards, 4);
        assert_eq!(config.index.max_probe, Some(32));
        assert_eq!(config.index.exact_search_threshold, 1024);
        assert_eq!(config.query.recency_field.as_deref(), Some("dateModified"));
    }

    #[test]
    fn test_validation_errors() {
        assert!(EngineConfig::from_toml("[index]\nshards = 0").is_err());
        assert!(EngineConfig::from_toml("[archive]\nkind = \"http\"").is_err());
        assert!(EngineConfig::from_toml("[query]\ndefault_top_k = 500").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[refresh]\ninterval_secs = 60").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.refresh.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = EngineConfig::load(Path::new("/nonexistent/dandi.toml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
