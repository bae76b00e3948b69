//! Deterministic reordering of index hits.

use serde_json::Value;
use std::cmp::Ordering;

use crate::index::SearchHit;

pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Reorder `hits` in place. Must be deterministic.
    fn rerank(&self, hits: &mut [SearchHit]);
}

/// Orders hits with equal scores by a payload timestamp, newest first, then
/// by id. Hits without the field sort after those with it.
#[derive(Debug, Clone)]
pub struct RecencyReranker {
    field: String,
}

impl RecencyReranker {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Reranker for RecencyReranker {
    fn name(&self) -> &str {
        "recency"
    }

    fn rerank(&self, hits: &mut [SearchHit]) {
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| {
                    compare_values(b.payload.get(&self.field), a.payload.get(&self.field))
                })
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.map(first_scalar), b.map(first_scalar)) {
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NEG_INFINITY);
            let y = y.as_f64().unwrap_or(f64::NEG_INFINITY);
            x.total_cmp(&y)
        }
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

fn first_scalar(value: &Value) -> &Value {
    match value {
        Value::Array(items) => items.first().unwrap_or(value),
        other => other,
    }
}
