//! Step registry - maps step types to processor implementations

pub mod builtin;

use crate::core::{PipelineError, StepConfig};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Error returned by a processor for a single attempt
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error("{message}")]
    Processing { message: String, retryable: bool },

    /// The payload is not something this processor can handle; marked non-retryable
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StepError {
    pub fn retryable(message: impl Into<String>) -> Self {
        StepError::Processing {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StepError::Processing {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Processing { retryable: true, .. })
    }

    /// Attach the step ID and classify
    pub fn into_pipeline_error(self, step_id: &str) -> PipelineError {
        let retryable = self.is_retryable();
        PipelineError::StepProcessing {
            step_id: step_id.to_string(),
            message: self.to_string(),
            retryable,
        }
    }
}

/// Result of a successful step attempt
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Payload handed to the next step
    pub data: Value,
    /// Rows rejected by this step
    pub records_with_errors: u64,
    pub warnings: Vec<String>,
}

impl StepOutput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            records_with_errors: 0,
            warnings: Vec::new(),
        }
    }

    pub fn with_rejected(mut self, records_with_errors: u64) -> Self {
        self.records_with_errors = records_with_errors;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Outcome of `StepProcessor::validate_config`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// Valid exactly when `errors` is empty
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// A pluggable unit of work behind a step type
#[async_trait]
pub trait StepProcessor: Send + Sync {
    /// Registry key this processor serves
    fn step_type(&self) -> &str;

    /// Transform `input` according to `config`
    async fn process(&self, input: &Value, config: &StepConfig) -> Result<StepOutput, StepError>;

    /// Check a config before any run uses it
    fn validate_config(&self, config: &StepConfig) -> ConfigValidation;

    /// Config used when a step is created without one
    fn default_config(&self) -> StepConfig;
}

/// Errors raised while building a registry
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("step type '{0}' is already registered")]
    Duplicate(String),

    #[error("processor for '{registered}' declares default config of type '{declared}'")]
    KeyMismatch { registered: String, declared: String },

    #[error("default config for '{step_type}' is invalid: {}", .errors.join("; "))]
    InvalidDefault { step_type: String, errors: Vec<String> },
}

/// Read-only table of processors, built once at startup
pub struct StepRegistry {
    processors: HashMap<String, Arc<dyn StepProcessor>>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::default()
    }

    /// Registry holding every built-in processor
    pub fn with_builtins() -> Self {
        let mut processors: HashMap<String, Arc<dyn StepProcessor>> = HashMap::new();
        for processor in builtin::all() {
            processors.insert(processor.step_type().to_string(), processor);
        }
        Self { processors }
    }

    /// Look up the processor for a step type
    pub fn resolve(&self, step_type: &str) -> Result<Arc<dyn StepProcessor>, PipelineError> {
        self.processors
            .get(step_type)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownStepType(step_type.to_string()))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.processors.contains_key(step_type)
    }

    /// Registered step types, sorted
    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}

/// Collects processors, checking each one as it is added
#[derive(Default)]
pub struct StepRegistryBuilder {
    processors: HashMap<String, Arc<dyn StepProcessor>>,
}

impl StepRegistryBuilder {
    pub fn register<P: StepProcessor + 'static>(self, processor: P) -> Result<Self, RegistryError> {
        self.register_arc(Arc::new(processor))
    }

    pub fn register_arc(mut self, processor: Arc<dyn StepProcessor>) -> Result<Self, RegistryError> {
        let step_type = processor.step_type().to_string();
        if self.processors.contains_key(&step_type) {
            return Err(RegistryError::Duplicate(step_type));
        }

        let default = processor.default_config();
        if default.step_type() != step_type {
            return Err(RegistryError::KeyMismatch {
                registered: step_type,
                declared: default.step_type().to_string(),
            });
        }

        let validation = processor.validate_config(&default);
        if !validation.valid {
            return Err(RegistryError::InvalidDefault {
                step_type,
                errors: validation.errors,
            });
        }

        self.processors.insert(step_type, processor);
        Ok(self)
    }

    /// Add every built-in processor
    pub fn with_builtins(mut self) -> Result<Self, RegistryError> {
        for processor in builtin::all() {
            self = self.register_arc(processor)?;
        }
        Ok(self)
    }

    pub fn build(self) -> StepRegistry {
        StepRegistry {
            processors: self.processors,
        }
    }
}
