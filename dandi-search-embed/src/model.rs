//! Identity of an embedding model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Describes the model that produced a set of vectors. Vectors from different
/// descriptors are never comparable, so every stored embedding and every
/// index generation is tagged with [`ModelDescriptor::model_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub provider: String,
    pub model_name: String,
    pub model_version: String,
    pub dimension: usize,
}

impl ModelDescriptor {
    pub fn new(
        provider: impl Into<String>,
        model_name: impl Into<String>,
        model_version: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            provider: provider.into(),
            model_name: model_name.into(),
            model_version: model_version.into(),
            dimension,
        }
    }

    /// Stable identifier in the form `provider:name:version:dimension`.
    pub fn model_id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.provider, self.model_name, self.model_version, self.dimension
        )
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.model_id())
    }
}
