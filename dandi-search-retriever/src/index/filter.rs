//! Payload filters applied while scanning the index.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::Payload;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    Equals(Value),
    AnyOf(Vec<Value>),
}

impl FilterCondition {
    fn matches_scalar(&self, value: &Value) -> bool {
        match self {
            Self::Equals(expected) => values_match(value, expected),
            Self::AnyOf(options) => options.iter().any(|o| values_match(value, o)),
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match value {
            Value::Array(items) => items.iter().any(|item| self.matches_scalar(item)),
            other => self.matches_scalar(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub condition: FilterCondition,
}

/// Conjunction of field conditions. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub clauses: Vec<FieldFilter>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(FieldFilter {
            field: field.into(),
            condition: FilterCondition::Equals(value.into()),
        });
        self
    }

    pub fn any_of(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.clauses.push(FieldFilter {
            field: field.into(),
            condition: FilterCondition::AnyOf(values),
        });
        self
    }

    /// Parse `field=value` clauses as given on the command line. Values that
    /// parse as JSON are compared as JSON, anything else as a string.
    /// `field=a|b` matches either value.
    pub fn parse_clauses<S: AsRef<str>>(clauses: &[S]) -> anyhow::Result<Self> {
        let mut filter = Self::new();
        for clause in clauses {
            let clause = clause.as_ref();
            let (field, value) = clause
                .split_once('=')
                .filter(|(field, _)| !field.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("filter must look like field=value: {clause}"))?;
            let mut values: Vec<Value> = value.split('|').map(parse_value).collect();
            filter = if values.len() == 1 {
                filter.equals(field.trim(), values.remove(0))
            } else {
                filter.any_of(field.trim(), values)
            };
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        self.clauses.iter().all(|clause| {
            payload
                .get(&clause.field)
                .is_some_and(|value| clause.condition.matches(value))
        })
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.trim().to_string()))
}

/// JSON equality, except that strings also match numbers and booleans with
/// the same text.
fn values_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::Number(_) | Value::Bool(_)) => *a == expected.to_string(),
        (Value::Number(_) | Value::Bool(_), Value::String(e)) => actual.to_string() == *e,
        _ => actual == expected,
    }
}
