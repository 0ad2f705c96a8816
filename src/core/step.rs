//! Step domain model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default per-step timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Lifecycle flag maintained by whoever owns the definition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Active,
    /// Skipped at run time; data passes through unchanged
    Disabled,
    /// Marked by the owner after a configuration problem; still executed
    Error,
}

/// A single step in a pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique step identifier
    pub id: String,

    /// Position in the pipeline (>= 1, unique within the pipeline)
    pub order: u32,

    /// Registry key and typed configuration
    #[serde(flatten)]
    pub config: StepConfig,

    /// Proceed past this step when every attempt fails
    #[serde(default)]
    pub continue_on_error: bool,

    /// Additional attempts after the first failure
    #[serde(default)]
    pub retry_count: u32,

    /// Upper bound for a single attempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub status: StepStatus,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl StepDefinition {
    /// Create an active step with default fault policy
    pub fn new(id: impl Into<String>, order: u32, config: StepConfig) -> Self {
        Self {
            id: id.into(),
            order,
            config,
            continue_on_error: false,
            retry_count: 0,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            status: StepStatus::Active,
        }
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    /// Registry key of this step
    pub fn step_type(&self) -> &str {
        self.config.step_type()
    }

    /// Total attempts allowed for this step
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    pub fn is_disabled(&self) -> bool {
        self.status == StepStatus::Disabled
    }
}

/// Step configuration, keyed by step type.
///
/// Built-in types carry their own schema; anything else is kept as
/// [`StepConfig::Custom`] and resolved by its `step_type` at run time.
#[derive(Debug, Clone, PartialEq)]
pub enum StepConfig {
    Filter(FilterConfig),
    RenameFields(RenameFieldsConfig),
    SelectFields(SelectFieldsConfig),
    Deduplicate(DeduplicateConfig),
    Sort(SortConfig),
    ValidateSchema(ValidateSchemaConfig),
    Custom { step_type: String, settings: Value },
}

impl StepConfig {
    pub const FILTER: &'static str = "filter";
    pub const RENAME_FIELDS: &'static str = "rename_fields";
    pub const SELECT_FIELDS: &'static str = "select_fields";
    pub const DEDUPLICATE: &'static str = "deduplicate";
    pub const SORT: &'static str = "sort";
    pub const VALIDATE_SCHEMA: &'static str = "validate_schema";

    /// Build a config for a step type not known to this crate
    pub fn custom(step_type: impl Into<String>, settings: Value) -> Self {
        StepConfig::Custom {
            step_type: step_type.into(),
            settings,
        }
    }

    pub fn step_type(&self) -> &str {
        match self {
            StepConfig::Filter(_) => Self::FILTER,
            StepConfig::RenameFields(_) => Self::RENAME_FIELDS,
            StepConfig::SelectFields(_) => Self::SELECT_FIELDS,
            StepConfig::Deduplicate(_) => Self::DEDUPLICATE,
            StepConfig::Sort(_) => Self::SORT,
            StepConfig::ValidateSchema(_) => Self::VALIDATE_SCHEMA,
            StepConfig::Custom { step_type, .. } => step_type,
        }
    }

    /// Parse a `(type, config)` pair, applying the schema of built-in types
    pub fn from_parts(step_type: &str, config: Value) -> Result<Self, String> {
        fn typed<T: serde::de::DeserializeOwned>(step_type: &str, config: Value) -> Result<T, String> {
            let config = if config.is_null() {
                Value::Object(Default::default())
            } else {
                config
            };
            serde_json::from_value(config)
                .map_err(|e| format!("invalid config for step type '{}': {}", step_type, e))
        }

        Ok(match step_type {
            Self::FILTER => StepConfig::Filter(typed(step_type, config)?),
            Self::RENAME_FIELDS => StepConfig::RenameFields(typed(step_type, config)?),
            Self::SELECT_FIELDS => StepConfig::SelectFields(typed(step_type, config)?),
            Self::DEDUPLICATE => StepConfig::Deduplicate(typed(step_type, config)?),
            Self::SORT => StepConfig::Sort(typed(step_type, config)?),
            Self::VALIDATE_SCHEMA => StepConfig::ValidateSchema(typed(step_type, config)?),
            other if other.trim().is_empty() => return Err("step type must not be empty".to_string()),
            other => StepConfig::custom(other, config),
        })
    }

    /// The config body without its type key
    pub fn settings(&self) -> Value {
        let body = match self {
            StepConfig::Filter(c) => serde_json::to_value(c),
            StepConfig::RenameFields(c) => serde_json::to_value(c),
            StepConfig::SelectFields(c) => serde_json::to_value(c),
            StepConfig::Deduplicate(c) => serde_json::to_value(c),
            StepConfig::Sort(c) => serde_json::to_value(c),
            StepConfig::ValidateSchema(c) => serde_json::to_value(c),
            StepConfig::Custom { settings, .. } => return settings.clone(),
        };
        body.unwrap_or(Value::Null)
    }
}

/// Wire shape of a step config: `type` plus an untyped `config` body
#[derive(Serialize, Deserialize)]
struct StepConfigRepr {
    #[serde(rename = "type")]
    step_type: String,
    #[serde(default)]
    config: Value,
}

impl Serialize for StepConfig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StepConfigRepr {
            step_type: self.step_type().to_string(),
            config: self.settings(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StepConfig {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = StepConfigRepr::deserialize(deserializer)?;
        StepConfig::from_parts(&repr.step_type, repr.config).map_err(serde::de::Error::custom)
    }
}

/// Comparison used by the `filter` step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
    Matches,
    Exists,
}

/// Keep records whose `field` satisfies `operator` against `value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

/// Rename record fields (old name -> new name)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenameFieldsConfig {
    #[serde(default)]
    pub mappings: BTreeMap<String, String>,
}

/// Project records down to `fields`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectFieldsConfig {
    pub fields: Vec<String>,
}

/// Drop records whose `key_fields` repeat an earlier record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeduplicateConfig {
    pub key_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortConfig {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// Check required fields on every record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidateSchemaConfig {
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Drop invalid records instead of failing the step
    #[serde(default)]
    pub drop_invalid: bool,
}
