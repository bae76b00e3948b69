//! Normalization of raw archive metadata into searchable records.
//!
//! Archive responses are loosely typed JSON documents. The [`RecordNormalizer`]
//! validates them at the ingestion boundary and produces a
//! [`NormalizedRecord`] with the three required fields (`id`, `version`,
//! `text`) plus an open payload map of auxiliary fields used for filtering
//! and reranking.
//!
//! Field lookups use dotted paths (`assetsSummary.species.name`). Arrays are
//! flattened at every step, so a path can fan out to many values.
//!
//! ```
//! use dandi_search_text::{NormalizerConfig, RecordNormalizer};
//! use serde_json::json;
//!
//! let normalizer = RecordNormalizer::new(NormalizerConfig::default());
//! let raw = json!({
//!     "identifier": "DANDI:000001",
//!     "version": "draft",
//!     "name": "Olfactory bulb recordings",
//!     "description": "<p>Extracellular recordings in <b>rat</b></p>",
//!     "keywords": ["olfaction", "rat"]
//! });
//! let record = normalizer.normalize(&raw).unwrap();
//! assert_eq!(record.id, "000001");
//! assert_eq!(record.text, "Olfactory bulb recordings Extracellular recordings in rat olfaction rat");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::markup::{collapse_whitespace, strip_markup, truncate_chars};

/// Errors raised while normalizing a raw record. These are permanent for the
/// given input: retrying the same document yields the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record is missing required field `{field}`")]
    MissingField { field: String },

    #[error("field `{field}` has an unsupported type")]
    InvalidField { field: String },

    #[error("record {id} has no searchable text")]
    EmptyText { id: String },
}

/// Which fields of a raw document feed each part of the normalized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Candidate paths for the identifier, first match wins.
    pub id_fields: Vec<String>,
    /// Prefix removed from identifiers (e.g. `DANDI:`).
    pub id_strip_prefix: Option<String>,
    /// Candidate paths for the version token, first match wins.
    pub version_fields: Vec<String>,
    /// Paths concatenated, in order, into the searchable text.
    pub text_fields: Vec<String>,
    /// Paths copied verbatim into the payload.
    pub payload_fields: Vec<String>,
    /// Upper bound on the normalized text length, in characters.
    pub max_text_chars: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            id_fields: vec!["identifier".into(), "id".into()],
            id_strip_prefix: Some("DANDI:".into()),
            version_fields: vec!["version".into()],
            text_fields: vec![
                "name".into(),
                "title".into(),
                "description".into(),
                "keywords".into(),
                "about.name".into(),
                "assetsSummary.species.name".into(),
                "assetsSummary.approach.name".into(),
                "assetsSummary.measurementTechnique.name".into(),
            ],
            payload_fields: vec![
                "name".into(),
                "category".into(),
                "dateModified".into(),
                "dateCreated".into(),
                "license".into(),
                "assetsSummary.species.name".into(),
            ],
            max_text_chars: 8192,
        }
    }
}

/// A validated record ready for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: String,
    pub version: String,
    pub text: String,
    pub payload: BTreeMap<String, Value>,
}

/// Turns raw archive documents into [`NormalizedRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct RecordNormalizer {
    config: NormalizerConfig,
}

impl RecordNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Extract only the identifier of a raw document. Used to attribute
    /// failures when full normalization fails.
    pub fn extract_id(&self, raw: &Value) -> Result<String, NormalizeError> {
        if !raw.is_object() {
            return Err(NormalizeError::NotAnObject);
        }
        let id = self.normalize_id(&first_scalar(raw, &self.config.id_fields, "id")?);
        if id.is_empty() {
            return Err(NormalizeError::MissingField { field: "id".into() });
        }
        Ok(id)
    }

    /// Apply the identifier rules to a bare id, as found in delete events.
    pub fn normalize_id(&self, raw_id: &str) -> String {
        let id = raw_id.trim();
        let id = match &self.config.id_strip_prefix {
            Some(prefix) => id.strip_prefix(prefix.as_str()).unwrap_or(id),
            None => id,
        };
        id.trim().to_string()
    }

    /// Normalize a raw document.
    pub fn normalize(&self, raw: &Value) -> Result<NormalizedRecord, NormalizeError> {
        let id = self.extract_id(raw)?;
        let version = first_scalar(raw, &self.config.version_fields, "version")?;

        let mut seen = HashSet::new();
        let mut parts = Vec::new();
        for field in &self.config.text_fields {
            for value in resolve_path(raw, field) {
                let mut strings = Vec::new();
                collect_strings(value, &mut strings);
                for s in strings {
                    let cleaned = strip_markup(s);
                    if cleaned.is_empty() {
                        continue;
                    }
                    if seen.insert(cleaned.to_lowercase()) {
                        parts.push(cleaned);
                    }
                }
            }
        }

        let text = collapse_whitespace(&parts.join(" "));
        let text = truncate_chars(&text, self.config.max_text_chars).to_string();
        if text.is_empty() {
            return Err(NormalizeError::EmptyText { id });
        }

        let mut payload = BTreeMap::new();
        for field in &self.config.payload_fields {
            let values = resolve_path(raw, field);
            match values.len() {
                0 => {}
                1 => {
                    payload.insert(field.clone(), values[0].clone());
                }
                _ => {
                    payload.insert(
                        field.clone(),
                        Value::Array(values.into_iter().cloned().collect()),
                    );
                }
            }
        }

        Ok(NormalizedRecord {
            id,
            version,
            text,
            payload,
        })
    }
}

/// Resolve a dotted path, flattening arrays along the way.
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![value];
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let mut next = Vec::new();
        for v in current {
            step(v, segment, &mut next);
        }
        current = next;
    }
    let mut flattened = Vec::new();
    for v in current {
        match v {
            Value::Array(items) => flattened.extend(items.iter().filter(|i| !i.is_null())),
            Value::Null => {}
            other => flattened.push(other),
        }
    }
    flattened
}

fn step<'a>(value: &'a Value, segment: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(segment) {
                out.push(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                step(item, segment, out);
            }
        }
        _ => {}
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

fn first_scalar(raw: &Value, paths: &[String], label: &str) -> Result<String, NormalizeError> {
    for path in paths {
        if let Some(value) = resolve_path(raw, path).into_iter().next() {
            return match value {
                Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
                Value::String(_) => continue,
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(NormalizeError::InvalidField {
                    field: path.clone(),
                }),
            };
        }
    }
    Err(NormalizeError::MissingField {
        field: label.to_string(),
    })
}
