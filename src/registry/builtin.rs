//! Built-in processors for record-array payloads
//!
//! Every processor here expects the payload to be a JSON array of objects.

use super::{ConfigValidation, StepError, StepOutput, StepProcessor};
use crate::core::step::{
    DeduplicateConfig, FilterConfig, FilterOperator, RenameFieldsConfig, SelectFieldsConfig,
    SortConfig, StepConfig, ValidateSchemaConfig,
};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// All built-in processors
pub fn all() -> Vec<Arc<dyn StepProcessor>> {
    vec![
        Arc::new(FilterProcessor),
        Arc::new(RenameFieldsProcessor),
        Arc::new(SelectFieldsProcessor),
        Arc::new(DeduplicateProcessor),
        Arc::new(SortProcessor),
        Arc::new(ValidateSchemaProcessor),
    ]
}

fn records(input: &Value) -> Result<&Vec<Value>, StepError> {
    input
        .as_array()
        .ok_or_else(|| StepError::InvalidInput("expected an array of records".to_string()))
}

fn mismatched(expected: &str, config: &StepConfig) -> StepError {
    StepError::permanent(format!(
        "expected {} config, got '{}'",
        expected,
        config.step_type()
    ))
}

fn blank_names<'a>(names: impl IntoIterator<Item = &'a String>, what: &str) -> Vec<String> {
    names
        .into_iter()
        .filter(|n| n.trim().is_empty())
        .map(|_| format!("{} must not contain empty field names", what))
        .take(1)
        .collect()
}

/// Order JSON scalars: numbers numerically, strings lexically, null first
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

pub struct FilterProcessor;

impl FilterProcessor {
    fn matches(config: &FilterConfig, pattern: Option<&Regex>, record: &Value) -> bool {
        let field = record.get(&config.field);
        match config.operator {
            FilterOperator::Exists => field.is_some_and(|v| !v.is_null()),
            FilterOperator::Eq => field == Some(&config.value),
            FilterOperator::Ne => field != Some(&config.value),
            FilterOperator::Gt => field.is_some_and(|v| {
                !v.is_null() && compare_values(v, &config.value) == Ordering::Greater
            }),
            FilterOperator::Lt => field.is_some_and(|v| {
                !v.is_null() && compare_values(v, &config.value) == Ordering::Less
            }),
            FilterOperator::Contains => match (field, &config.value) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
            FilterOperator::Matches => match (field, pattern) {
                (Some(Value::String(s)), Some(regex)) => regex.is_match(s),
                _ => false,
            },
        }
    }
}

#[async_trait]
impl StepProcessor for FilterProcessor {
    fn step_type(&self) -> &str {
        StepConfig::FILTER
    }

    async fn process(&self, input: &Value, config: &StepConfig) -> Result<StepOutput, StepError> {
        let StepConfig::Filter(config) = config else {
            return Err(mismatched(StepConfig::FILTER, config));
        };
        let rows = records(input)?;

        let pattern = match config.operator {
            FilterOperator::Matches => {
                let source = config.value.as_str().unwrap_or_default();
                Some(Regex::new(source).map_err(|e| StepError::permanent(e.to_string()))?)
            }
            _ => None,
        };

        let kept: Vec<Value> = rows
            .iter()
            .filter(|row| Self::matches(config, pattern.as_ref(), row))
            .cloned()
            .collect();
        Ok(StepOutput::new(Value::Array(kept)))
    }

    fn validate_config(&self, config: &StepConfig) -> ConfigValidation {
        let StepConfig::Filter(config) = config else {
            return ConfigValidation::from_errors(vec![mismatched(StepConfig::FILTER, config).to_string()]);
        };

        let mut errors = Vec::new();
        if config.field.trim().is_empty() {
            errors.push("filter field must not be empty".to_string());
        }
        match config.operator {
            FilterOperator::Matches => match config.value.as_str() {
                Some(source) => {
                    if let Err(e) = Regex::new(source) {
                        errors.push(format!("invalid regex: {}", e));
                    }
                }
                None => errors.push("matches operator needs a string pattern".to_string()),
            },
            FilterOperator::Gt | FilterOperator::Lt if config.value.is_null() => {
                errors.push("comparison operators need a value".to_string());
            }
            _ => {}
        }
        ConfigValidation::from_errors(errors)
    }

    fn default_config(&self) -> StepConfig {
        StepConfig::Filter(FilterConfig {
            field: "id".to_string(),
            operator: FilterOperator::Exists,
            value: Value::Null,
        })
    }
}

pub struct RenameFieldsProcessor;

#[async_trait]
impl StepProcessor for RenameFieldsProcessor {
    fn step_type(&self) -> &str {
        StepConfig::RENAME_FIELDS
    }

    async fn process(&self, input: &Value, config: &StepConfig) -> Result<StepOutput, StepError> {
        let StepConfig::RenameFields(config) = config else {
            return Err(mismatched(StepConfig::RENAME_FIELDS, config));
        };

        let renamed = records(input)?
            .iter()
            .map(|row| match row {
                Value::Object(fields) => {
                    let mut out = Map::with_capacity(fields.len());
                    for (key, value) in fields {
                        let key = config.mappings.get(key).unwrap_or(key);
                        out.insert(key.clone(), value.clone());
                    }
                    Value::Object(out)
                }
                other => other.clone(),
            })
            .collect();
        Ok(StepOutput::new(Value::Array(renamed)))
    }

    fn validate_config(&self, config: &StepConfig) -> ConfigValidation {
        let StepConfig::RenameFields(config) = config else {
            return ConfigValidation::from_errors(vec![mismatched(StepConfig::RENAME_FIELDS, config).to_string()]);
        };

        let mut errors = blank_names(config.mappings.keys().chain(config.mappings.values()), "mappings");
        let targets: HashSet<&String> = config.mappings.values().collect();
        if targets.len() != config.mappings.len() {
            errors.push("two fields are renamed to the same name".to_string());
        }
        ConfigValidation::from_errors(errors)
    }

    fn default_config(&self) -> StepConfig {
        StepConfig::RenameFields(RenameFieldsConfig {
            mappings: BTreeMap::new(),
        })
    }
}

pub struct SelectFieldsProcessor;

#[async_trait]
impl StepProcessor for SelectFieldsProcessor {
    fn step_type(&self) -> &str {
        StepConfig::SELECT_FIELDS
    }

    async fn process(&self, input: &Value, config: &StepConfig) -> Result<StepOutput, StepError> {
        let StepConfig::SelectFields(config) = config else {
            return Err(mismatched(StepConfig::SELECT_FIELDS, config));
        };

        let projected = records(input)?
            .iter()
            .map(|row| {
                let mut out = Map::new();
                for field in &config.fields {
                    if let Some(value) = row.get(field) {
                        out.insert(field.clone(), value.clone());
                    }
                }
                Value::Object(out)
            })
            .collect();
        Ok(StepOutput::new(Value::Array(projected)))
    }

    fn validate_config(&self, config: &StepConfig) -> ConfigValidation {
        let StepConfig::SelectFields(config) = config else {
            return ConfigValidation::from_errors(vec![mismatched(StepConfig::SELECT_FIELDS, config).to_string()]);
        };

        let mut errors = blank_names(&config.fields, "fields");
        if config.fields.is_empty() {
            errors.push("select_fields needs at least one field".to_string());
        }
        ConfigValidation::from_errors(errors)
    }

    fn default_config(&self) -> StepConfig {
        StepConfig::SelectFields(SelectFieldsConfig {
            fields: vec!["id".to_string()],
        })
    }
}

pub struct DeduplicateProcessor;

#[async_trait]
impl StepProcessor for DeduplicateProcessor {
    fn step_type(&self) -> &str {
        StepConfig::DEDUPLICATE
    }

    async fn process(&self, input: &Value, config: &StepConfig) -> Result<StepOutput, StepError> {
        let StepConfig::Deduplicate(config) = config else {
            return Err(mismatched(StepConfig::DEDUPLICATE, config));
        };
        let rows = records(input)?;

        let mut seen = HashSet::new();
        let unique: Vec<Value> = rows
            .iter()
            .filter(|row| {
                let key: Vec<String> = config
                    .key_fields
                    .iter()
                    .map(|f| row.get(f).map(Value::to_string).unwrap_or_default())
                    .collect();
                seen.insert(key)
            })
            .cloned()
            .collect();

        let dropped = rows.len() - unique.len();
        let mut output = StepOutput::new(Value::Array(unique));
        if dropped > 0 {
            output = output.with_warning(format!("removed {} duplicate record(s)", dropped));
        }
        Ok(output)
    }

    fn validate_config(&self, config: &StepConfig) -> ConfigValidation {
        let StepConfig::Deduplicate(config) = config else {
            return ConfigValidation::from_errors(vec![mismatched(StepConfig::DEDUPLICATE, config).to_string()]);
        };

        let mut errors = blank_names(&config.key_fields, "key_fields");
        if config.key_fields.is_empty() {
            errors.push("deduplicate needs at least one key field".to_string());
        }
        ConfigValidation::from_errors(errors)
    }

    fn default_config(&self) -> StepConfig {
        StepConfig::Deduplicate(DeduplicateConfig {
            key_fields: vec!["id".to_string()],
        })
    }
}

pub struct SortProcessor;

#[async_trait]
impl StepProcessor for SortProcessor {
    fn step_type(&self) -> &str {
        StepConfig::SORT
    }

    async fn process(&self, input: &Value, config: &StepConfig) -> Result<StepOutput, StepError> {
        let StepConfig::Sort(config) = config else {
            return Err(mismatched(StepConfig::SORT, config));
        };

        let mut rows = records(input)?.clone();
        rows.sort_by(|a, b| {
            let ordering = compare_values(
                a.get(&config.field).unwrap_or(&Value::Null),
                b.get(&config.field).unwrap_or(&Value::Null),
            );
            if config.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        Ok(StepOutput::new(Value::Array(rows)))
    }

    fn validate_config(&self, config: &StepConfig) -> ConfigValidation {
        let StepConfig::Sort(config) = config else {
            return ConfigValidation::from_errors(vec![mismatched(StepConfig::SORT, config).to_string()]);
        };

        if config.field.trim().is_empty() {
            return ConfigValidation::from_errors(vec!["sort field must not be empty".to_string()]);
        }
        ConfigValidation::ok()
    }

    fn default_config(&self) -> StepConfig {
        StepConfig::Sort(SortConfig {
            field: "id".to_string(),
            descending: false,
        })
    }
}

pub struct ValidateSchemaProcessor;

#[async_trait]
impl StepProcessor for ValidateSchemaProcessor {
    fn step_type(&self) -> &str {
        StepConfig::VALIDATE_SCHEMA
    }

    async fn process(&self, input: &Value, config: &StepConfig) -> Result<StepOutput, StepError> {
        let StepConfig::ValidateSchema(config) = config else {
            return Err(mismatched(StepConfig::VALIDATE_SCHEMA, config));
        };
        let rows = records(input)?;

        let (valid, invalid): (Vec<&Value>, Vec<&Value>) = rows.iter().partition(|row| {
            config
                .required_fields
                .iter()
                .all(|f| row.get(f).is_some_and(|v| !v.is_null()))
        });

        if invalid.is_empty() {
            return Ok(StepOutput::new(input.clone()));
        }
        if !config.drop_invalid {
            return Err(StepError::permanent(format!(
                "{} record(s) missing required fields {:?}",
                invalid.len(),
                config.required_fields
            )));
        }

        let kept = valid.into_iter().cloned().collect();
        Ok(StepOutput::new(Value::Array(kept))
            .with_rejected(invalid.len() as u64)
            .with_warning(format!("dropped {} invalid record(s)", invalid.len())))
    }

    fn validate_config(&self, config: &StepConfig) -> ConfigValidation {
        let StepConfig::ValidateSchema(config) = config else {
            return ConfigValidation::from_errors(vec![mismatched(StepConfig::VALIDATE_SCHEMA, config).to_string()]);
        };
        ConfigValidation::from_errors(blank_names(&config.required_fields, "required_fields"))
    }

    fn default_config(&self) -> StepConfig {
        StepConfig::ValidateSchema(ValidateSchemaConfig::default())
    }
}
