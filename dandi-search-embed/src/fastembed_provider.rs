//! FastEmbed-based embedding provider using local ONNX models

use crate::config::{EmbedConfig, PromptTemplates};
use crate::error::{EmbedError, Result};
use crate::model::ModelDescriptor;
use crate::provider::{EmbedRole, EmbeddingProvider, EmbeddingResult};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Type alias for cached model entries (model, dimension)
type ModelCacheEntry = (Arc<Mutex<TextEmbedding>>, usize);

/// Global cache for initialized embedding models to avoid reloading
static MODEL_CACHE: OnceLock<Mutex<HashMap<String, ModelCacheEntry>>> = OnceLock::new();

fn get_model_cache() -> &'static Mutex<HashMap<String, ModelCacheEntry>> {
    MODEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| EmbedError::provider("model lock poisoned", false))
}

/// Map a configured model name onto a fastembed built-in model.
pub fn resolve_model(name: &str) -> Result<EmbeddingModel> {
    let model = match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
        "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "multilingual-e5-small" => EmbeddingModel::MultilingualE5Small,
        "nomic-embed-text-v1.5" => EmbeddingModel::NomicEmbedTextV15,
        other => {
            return Err(EmbedError::invalid_config(format!(
                "unsupported fastembed model: {other}"
            )));
        }
    };
    Ok(model)
}

/// Provider backed by a fastembed [`TextEmbedding`] model.
#[derive(Clone)]
pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: Arc<Mutex<TextEmbedding>>,
    descriptor: ModelDescriptor,
    templates: PromptTemplates,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("config", &self.config)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl FastEmbedProvider {
    /// Load (or reuse from the process-wide cache) the configured model.
    pub async fn create(config: EmbedConfig) -> Result<Self> {
        config.validate()?;
        let model_kind = resolve_model(&config.model_name)?;
        let cache_key = format!(
            "{}:{}",
            config.model_name,
            config
                .cache_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );

        let cached = {
            let cache = lock(get_model_cache())?;
            cache
                .get(&cache_key)
                .map(|(model, dim)| (Arc::clone(model), *dim))
        };

        let (model, dimension) = match cached {
            Some(entry) => {
                tracing::info!("Using cached model for: {}", config.model_name);
                entry
            }
            None => {
                let load_config = config.clone();
                let (model, dimension) =
                    tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                        tracing::info!("Loading embedding model: {}", load_config.model_name);

                        let mut init_options =
                            InitOptions::new(model_kind).with_show_download_progress(false);
                        if let Some(dir) = &load_config.cache_dir {
                            init_options = init_options.with_cache_dir(dir.clone());
                        }
                        let mut model = TextEmbedding::try_new(init_options)
                            .map_err(|e| EmbedError::External { source: e })?;

                        let probe = model
                            .embed(vec!["dimension probe".to_string()], None)
                            .map_err(|e| EmbedError::External { source: e })?;
                        let dimension = probe.first().map(|emb| emb.len()).unwrap_or(0);
                        if dimension == 0 {
                            return Err(EmbedError::invalid_config(
                                "model produced an empty embedding",
                            ));
                        }

                        tracing::info!("Model loaded successfully. Dimension: {}", dimension);
                        Ok((model, dimension))
                    })
                    .await??;

                let model = Arc::new(Mutex::new(model));
                lock(get_model_cache())?.insert(cache_key, (Arc::clone(&model), dimension));
                (model, dimension)
            }
        };

        let descriptor = ModelDescriptor::new(
            "fastembed",
            config.model_name.clone(),
            config.model_version.clone(),
            dimension,
        );
        let templates = config.templates.clone();
        Ok(Self {
            config,
            model,
            descriptor,
            templates,
        })
    }

    /// Clears the global model cache.
    pub fn clear_cache() {
        if let Ok(mut cache) = get_model_cache().lock() {
            cache.clear();
            tracing::info!("Model cache cleared");
        }
    }

    /// Returns the number of cached models.
    pub fn cache_size() -> usize {
        get_model_cache().lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_texts(&self, texts: &[String], role: EmbedRole) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        let prepared: Vec<String> = texts
            .iter()
            .map(|t| self.templates.apply(role, t))
            .collect();
        let model = Arc::clone(&self.model);

        tracing::debug!("Generating embeddings for {} texts", prepared.len());
        let embeddings = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut model_guard = lock(&model)?;
            model_guard
                .embed(prepared, None)
                .map_err(|e| EmbedError::External { source: e })
        })
        .await??;

        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.descriptor.dimension
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }

    fn descriptor(&self) -> ModelDescriptor {
        self.descriptor.clone()
    }
}
