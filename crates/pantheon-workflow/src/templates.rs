//! Workflow templates library
//!
//! Ships the built-in definitions and lets callers derive customized copies.

use crate::definition::{
    ErrorHandling, GlobalSettings, ParameterSpec, StageSpec, WorkflowDefinition,
};
use crate::{Result, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

const BUILTIN: &[(&str, &str)] = &[
    (
        "feature-development",
        include_str!("../templates/feature-development.yaml"),
    ),
    ("bug-fix", include_str!("../templates/bug-fix.yaml")),
    (
        "quick-validation",
        include_str!("../templates/quick-validation.yaml"),
    ),
];

/// Overrides applied on top of a template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateCustomization {
    /// Added or replaced stages
    #[serde(default)]
    pub stages: BTreeMap<String, StageSpec>,
    /// Set fields override the template's settings
    #[serde(default)]
    pub global_settings: Option<GlobalSettings>,
    #[serde(default)]
    pub error_handling: Option<ErrorHandling>,
    /// Appended to the template's parameters
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl TemplateCustomization {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, name: impl Into<String>, stage: StageSpec) -> Self {
        self.stages.insert(name.into(), stage);
        self
    }

    pub fn with_global_settings(mut self, settings: GlobalSettings) -> Self {
        self.global_settings = Some(settings);
        self
    }

    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.error_handling = Some(error_handling);
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }
}

/// Named workflow definitions
#[derive(Debug, Clone, Default)]
pub struct TemplateLibrary {
    templates: HashMap<String, WorkflowDefinition>,
}

impl TemplateLibrary {
    /// An empty library
    pub fn new() -> Self {
        Self::default()
    }

    /// A library holding the built-in templates
    pub fn builtin() -> Result<Self> {
        let mut library = Self::new();
        for (name, yaml) in BUILTIN {
            let definition = WorkflowDefinition::from_yaml_str(yaml)?;
            debug!(template = %name, stages = definition.stages.len(), "Loaded built-in template");
            library.register(definition);
        }
        Ok(library)
    }

    /// Add or replace a template under its definition name
    pub fn register(&mut self, definition: WorkflowDefinition) {
        info!(template = %definition.name, "Registered workflow template");
        self.templates.insert(definition.name.clone(), definition);
    }

    /// An independent copy of the named template
    pub fn get(&self, name: &str) -> Result<WorkflowDefinition> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::TemplateNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Template names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }

    /// Copy a template and apply `customization` to it
    pub fn customize(
        &self,
        name: &str,
        customization: TemplateCustomization,
    ) -> Result<WorkflowDefinition> {
        let mut definition = self.get(name)?;

        definition.stages.extend(customization.stages);

        if let Some(settings) = customization.global_settings {
            let target = &mut definition.global_settings;
            if settings.max_parallel_stages.is_some() {
                target.max_parallel_stages = settings.max_parallel_stages;
            }
            if settings.total_timeout.is_some() {
                target.total_timeout = settings.total_timeout;
            }
            if settings.validation_mode.is_some() {
                target.validation_mode = settings.validation_mode;
            }
            if !settings.notification_channels.is_empty() {
                target.notification_channels = settings.notification_channels;
            }
        }

        if let Some(handling) = customization.error_handling {
            let target = &mut definition.error_handling;
            target.on_stage_failure = handling.on_stage_failure;
            if handling.on_validation_failure.is_some() {
                target.on_validation_failure = handling.on_validation_failure;
            }
            if !handling.notification_channels.is_empty() {
                target.notification_channels = handling.notification_channels;
            }
        }

        definition.parameters.extend(customization.parameters);

        Ok(definition)
    }

    /// Structural problems in a definition; empty when it is usable.
    ///
    /// This is a cheap check for authored templates. The engine's `load`
    /// performs the full validation against its registered workers.
    pub fn validate(definition: &WorkflowDefinition) -> Vec<String> {
        let mut errors = Vec::new();

        if definition.name.trim().is_empty() {
            errors.push("Workflow name is required".to_string());
        }
        if definition.stages.is_empty() {
            errors.push("Workflow must have at least one stage".to_string());
        }

        for (name, stage) in &definition.stages {
            for dependency in &stage.depends_on {
                if !definition.stages.contains_key(dependency) {
                    errors.push(format!(
                        "Stage '{}' depends on unknown stage '{}'",
                        name, dependency
                    ));
                }
            }
            if stage.agent.trim().is_empty() {
                errors.push(format!("Stage '{}' missing required 'agent' field", name));
            }
        }

        errors
    }
}
