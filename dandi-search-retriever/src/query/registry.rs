//! Embedding generators by model id.

use dandi_search_embed::{EmbeddingGenerator, ModelDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Default)]
struct Registered {
    generators: HashMap<String, Arc<EmbeddingGenerator>>,
    current: Option<String>,
}

/// Keeps every generator a published generation may need. Queries pick the
/// generator matching the generation they search, so a model migration never
/// embeds a query with one model and compares it against another's vectors.
#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<Registered>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator. The first one registered becomes current.
    pub fn register(&self, generator: Arc<EmbeddingGenerator>) -> String {
        let model_id = generator.model_id();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.generators.insert(model_id.clone(), generator);
        if inner.current.is_none() {
            inner.current = Some(model_id.clone());
        }
        model_id
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<EmbeddingGenerator>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generators
            .get(model_id)
            .cloned()
    }

    pub fn current(&self) -> Option<Arc<EmbeddingGenerator>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .current
            .as_ref()
            .and_then(|id| inner.generators.get(id))
            .cloned()
    }

    pub fn current_id(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    /// Mark a registered model current. Returns false for unknown ids.
    pub fn set_current(&self, model_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.generators.contains_key(model_id) {
            return false;
        }
        inner.current = Some(model_id.to_string());
        true
    }

    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut descriptors: Vec<ModelDescriptor> = inner
            .generators
            .values()
            .map(|g| g.descriptor().clone())
            .collect();
        descriptors.sort_by_key(|d| d.model_id());
        descriptors
    }
}
