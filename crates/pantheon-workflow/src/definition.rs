//! Declarative workflow definitions
//!
//! A [`WorkflowDefinition`] is an immutable template: a map of named stages
//! with their dependencies and failure policies, plus workflow-wide settings.
//! Definitions are format-agnostic; YAML and JSON documents deserialize into
//! the same structure.

use crate::{Result, WorkflowError};
use once_cell::sync::Lazy;
use pantheon_core::{RetrySettings, ValidationMode};
use pantheon_resilience::{BackoffStrategy, RetryConfig, RetryPolicy};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default = "default_triggers")]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
    /// Stages keyed by name
    #[serde(default)]
    pub stages: BTreeMap<String, StageSpec>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_triggers() -> Vec<String> {
    vec!["manual".to_string()]
}

impl WorkflowDefinition {
    /// Create an empty definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: None,
            parameters: Vec::new(),
            triggers: default_triggers(),
            global_settings: GlobalSettings::default(),
            stages: BTreeMap::new(),
            error_handling: ErrorHandling::default(),
        }
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a stage
    pub fn with_stage(mut self, name: impl Into<String>, stage: StageSpec) -> Self {
        self.stages.insert(name.into(), stage);
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_global_settings(mut self, settings: GlobalSettings) -> Self {
        self.global_settings = settings;
        self
    }

    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.error_handling = error_handling;
        self
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Check run parameters against the declared ones, filling defaults.
    ///
    /// Undeclared parameters pass through untouched.
    pub fn resolve_parameters(&self, mut params: Map<String, Value>) -> Result<Map<String, Value>> {
        for spec in &self.parameters {
            match params.get(&spec.name) {
                Some(value) => {
                    if !spec.allowed.is_empty() && !spec.allowed.contains(value) {
                        return Err(WorkflowError::InvalidParameter {
                            name: spec.name.clone(),
                            reason: format!("{} is not one of {:?}", value, spec.allowed),
                        });
                    }
                }
                None => {
                    if let Some(default) = &spec.default {
                        params.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        return Err(WorkflowError::MissingParameter(spec.name.clone()));
                    }
                }
            }
        }

        Ok(params)
    }
}

/// Declared run parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub param_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values; empty means unrestricted
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<Value>,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            param_type: None,
            default: None,
            allowed: Vec::new(),
        }
    }

    pub fn optional(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            required: false,
            param_type: None,
            default: Some(default),
            allowed: Vec::new(),
        }
    }
}

/// Workflow-wide settings; unset values fall back to engine defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_stages: Option<usize>,
    #[serde(default, with = "duration_format", skip_serializing_if = "Option::is_none")]
    pub total_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_mode: Option<ValidationMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notification_channels: Vec<String>,
}

/// What the run does after an unrecoverable stage failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowFailurePolicy {
    /// Stop and report the failure
    #[default]
    Abort,
    /// Run compensations of completed stages, most recent first
    Rollback,
    /// Emit a notification event, then report the failure
    Notify,
    /// Keep scheduling stages that do not depend on the failure
    Continue,
}

/// Workflow-level error handling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub on_stage_failure: WorkflowFailurePolicy,
    /// Replaces `on_stage_failure` when the fatal error is a validation failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_validation_failure: Option<WorkflowFailurePolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notification_channels: Vec<String>,
}

impl ErrorHandling {
    pub fn new(on_stage_failure: WorkflowFailurePolicy) -> Self {
        Self {
            on_stage_failure,
            ..Default::default()
        }
    }

    pub fn with_validation_policy(mut self, policy: WorkflowFailurePolicy) -> Self {
        self.on_validation_failure = Some(policy);
        self
    }
}

/// Per-stage failure policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Fail the run
    #[default]
    Fail,
    /// Record the error as the stage result and carry on
    Continue,
    /// Mark the stage done without a result
    Skip,
    /// Re-dispatch the stage to its fallback agent
    Fallback,
}

/// Stage-level retry settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default, with = "duration_format", skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<Duration>,
    #[serde(default, with = "duration_format", skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<Duration>,
}

impl StageRetryPolicy {
    /// Build a retry policy, taking unset values from `defaults`
    pub fn to_policy(&self, defaults: &RetrySettings) -> RetryPolicy {
        let base = RetryConfig::from(defaults);
        let config = RetryConfig {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay.unwrap_or(base.initial_delay),
            max_delay: self.max_delay.unwrap_or(base.max_delay),
            strategy: self.backoff,
            ..base
        };
        RetryPolicy::new(config)
    }
}

/// Undo action for a completed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationSpec {
    pub agent: String,
    #[serde(default)]
    pub task: String,
}

/// Stage specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Worker that executes the stage
    pub agent: String,
    #[serde(default)]
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, with = "duration_format", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<StageRetryPolicy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub success_criteria: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<String>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_agent: Option<String>,
    #[serde(default, alias = "rollback", skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationSpec>,
    #[serde(default)]
    pub validation_required: bool,
}

impl StageSpec {
    pub fn new(agent: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn depends_on<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(stages.into_iter().map(Into::into));
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, max_retries: u32, backoff: BackoffStrategy) -> Self {
        self.retry_policy = Some(StageRetryPolicy {
            max_retries,
            backoff,
            ..Default::default()
        });
        self
    }

    pub fn with_retry_policy(mut self, policy: StageRetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_criterion(mut self, key: impl Into<String>, expected: Value) -> Self {
        self.success_criteria.insert(key.into(), expected);
        self
    }

    pub fn with_gate(mut self, gate: impl Into<String>) -> Self {
        self.gates.push(gate.into());
        self
    }

    pub fn on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }

    /// Fall back to `agent` when the stage fails
    pub fn with_fallback(mut self, agent: impl Into<String>) -> Self {
        self.on_failure = OnFailure::Fallback;
        self.fallback_agent = Some(agent.into());
        self
    }

    pub fn with_compensation(mut self, agent: impl Into<String>, task: impl Into<String>) -> Self {
        self.compensation = Some(CompensationSpec {
            agent: agent.into(),
            task: task.into(),
        });
        self
    }

    pub fn requires_validation(mut self) -> Self {
        self.validation_required = true;
        self
    }

    /// Declared task type, or one inferred from the task text
    pub fn task_type(&self) -> String {
        if let Some(task_type) = &self.task_type {
            return task_type.clone();
        }

        let task = self.task.to_lowercase();
        let inferred = if task.contains("validate") || task.contains("review") {
            "validation"
        } else if task.contains("implement") || task.contains("create") {
            "creation"
        } else if task.contains("design") || task.contains("architect") {
            "architecture"
        } else {
            "generic"
        };
        inferred.to_string()
    }
}

static DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\s*(ms|s|m|h)?\s*$").expect("duration pattern is a valid regex")
});

/// Parse `"500ms"`, `"30s"`, `"10m"`, `"2h"` or a bare number of milliseconds.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let captures = DURATION.captures(text)?;
    let value: u64 = captures.get(1)?.as_str().parse().ok()?;

    let duration = match captures.get(2).map(|m| m.as_str()) {
        None | Some("ms") => Duration::from_millis(value),
        Some("s") => Duration::from_secs(value),
        Some("m") => Duration::from_secs(value.checked_mul(60)?),
        Some("h") => Duration::from_secs(value.checked_mul(3600)?),
        Some(_) => return None,
    };

    Some(duration)
}

/// Serde adapter for optional durations written as strings or milliseconds
mod duration_format {
    use super::parse_duration;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
            Some(Raw::Text(text)) => parse_duration(&text)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid duration: {}", text))),
        }
    }
}
