//! Metadata filter grammar for vector store queries.
//!
//! A filter maps field names to conditions. A bare scalar means equality;
//! operator objects support `$in`, `$gt`, `$gte`, `$lt`, `$lte`, `$ne`.
//! Conditions on multiple fields are conjunctive.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::RagError;
use crate::types::{Metadata, MetadataValue};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterCondition {
    Eq(MetadataValue),
    Ne(MetadataValue),
    In(Vec<MetadataValue>),
    Gt(MetadataValue),
    Gte(MetadataValue),
    Lt(MetadataValue),
    Lte(MetadataValue),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    conditions: HashMap<String, FilterCondition>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, condition: FilterCondition) -> Self {
        self.conditions.insert(name.into(), condition);
        self
    }

    pub fn eq(self, name: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.field(name, FilterCondition::Eq(value.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Parse the JSON filter shape:
    /// `{"field": scalar}` or `{"field": {"$op": operand}}`.
    pub fn parse(value: &Value) -> Result<Self, RagError> {
        let Value::Object(map) = value else {
            return Err(RagError::InvalidFilter("filter must be an object".into()));
        };

        let mut conditions = HashMap::new();
        for (field, spec) in map {
            let condition = match spec {
                Value::Object(ops) => {
                    if ops.len() != 1 {
                        return Err(RagError::InvalidFilter(format!(
                            "field '{}' must have exactly one operator",
                            field
                        )));
                    }
                    let Some((op, operand)) = ops.iter().next() else {
                        return Err(RagError::InvalidFilter(format!(
                            "field '{}' has no operator",
                            field
                        )));
                    };
                    match op.as_str() {
                        "$in" => {
                            let Value::Array(items) = operand else {
                                return Err(RagError::InvalidFilter(format!(
                                    "$in on '{}' requires an array",
                                    field
                                )));
                            };
                            let values = items
                                .iter()
                                .map(scalar)
                                .collect::<Result<Vec<_>, _>>()?;
                            FilterCondition::In(values)
                        }
                        "$gt" => FilterCondition::Gt(scalar(operand)?),
                        "$gte" => FilterCondition::Gte(scalar(operand)?),
                        "$lt" => FilterCondition::Lt(scalar(operand)?),
                        "$lte" => FilterCondition::Lte(scalar(operand)?),
                        "$ne" => FilterCondition::Ne(scalar(operand)?),
                        other => {
                            return Err(RagError::InvalidFilter(format!(
                                "unknown operator '{}' on field '{}'",
                                other, field
                            )))
                        }
                    }
                }
                other => FilterCondition::Eq(scalar(other)?),
            };
            conditions.insert(field.clone(), condition);
        }

        Ok(Self { conditions })
    }

    /// Deterministic string form (fields sorted), for cache keys.
    pub fn canonical(&self) -> String {
        let mut fields: Vec<(&String, &FilterCondition)> = self.conditions.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        fields
            .into_iter()
            .map(|(field, condition)| format!("{}:{:?}", field, condition))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// True when every field condition matches. A field missing from the
    /// metadata never matches.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.conditions.iter().all(|(field, condition)| {
            let Some(value) = metadata.get(field) else {
                return false;
            };
            match condition {
                FilterCondition::Eq(expected) => value == expected,
                FilterCondition::Ne(expected) => value != expected,
                FilterCondition::In(options) => options.contains(value),
                FilterCondition::Gt(bound) => ordered(value, bound)
                    .map(|o| o == std::cmp::Ordering::Greater)
                    .unwrap_or(false),
                FilterCondition::Gte(bound) => ordered(value, bound)
                    .map(|o| o != std::cmp::Ordering::Less)
                    .unwrap_or(false),
                FilterCondition::Lt(bound) => ordered(value, bound)
                    .map(|o| o == std::cmp::Ordering::Less)
                    .unwrap_or(false),
                FilterCondition::Lte(bound) => ordered(value, bound)
                    .map(|o| o != std::cmp::Ordering::Greater)
                    .unwrap_or(false),
            }
        })
    }
}

fn scalar(value: &Value) -> Result<MetadataValue, RagError> {
    match value {
        Value::String(s) => Ok(MetadataValue::Str(s.clone())),
        Value::Number(n) => n
            .as_f64()
            .map(MetadataValue::Num)
            .ok_or_else(|| RagError::InvalidFilter("non-finite number in filter".into())),
        Value::Bool(b) => Ok(MetadataValue::Bool(*b)),
        other => Err(RagError::InvalidFilter(format!(
            "filter operands must be scalars, got {}",
            other
        ))),
    }
}

/// Ordering between two metadata values of the same variant. Numbers compare
/// numerically, strings lexicographically; mixed kinds don't order.
fn ordered(a: &MetadataValue, b: &MetadataValue) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (MetadataValue::Num(x), MetadataValue::Num(y)) => x.partial_cmp(y),
        (MetadataValue::Str(x), MetadataValue::Str(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
