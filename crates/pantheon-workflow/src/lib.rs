//! Workflow engine for multi-agent pipelines
//!
//! This crate provides:
//! - Declarative workflow definitions (YAML/JSON) with parameters and policies
//! - Load-time dependency graph validation
//! - A bounded-concurrency stage scheduler with pause, resume and cancel
//! - Stage gates, success criteria and external validation
//! - Per-stage retry, fallback workers and workflow-level rollback
//! - Reusable execution patterns (sequential, parallel, race, saga, ...)
//! - Run monitoring and built-in workflow templates

pub mod dag;
pub mod definition;
pub mod engine;
pub mod gates;
pub mod monitor;
pub mod patterns;
pub mod run;
pub mod templates;
pub mod worker;

pub use dag::{DagValidationError, StageDag};
pub use definition::{
    CompensationSpec, ErrorHandling, GlobalSettings, OnFailure, ParameterSpec, StageRetryPolicy,
    StageSpec, WorkflowDefinition, WorkflowFailurePolicy,
};
pub use engine::{LoadedWorkflow, RunHandle, WorkflowEngine, WorkflowEngineBuilder};
pub use gates::{Gate, GateRegistry};
pub use monitor::{FailureCategory, RunMonitor, WorkflowStats};
pub use patterns::{
    CompensationReport, ExecutionPatterns, PatternError, PatternKind, PatternResult, SagaStep,
    SharedTask, Task, TaskSpec,
};
pub use run::{
    FailureCause, RunFailure, RunResult, RunState, StageError, StageMetrics, StageOutcome,
    WorkflowRun,
};
pub use templates::{TemplateCustomization, TemplateLibrary};
pub use worker::{
    SharedWorker, StageTask, ValidationProfile, ValidationReport, Validator, Worker,
    WorkerRegistry,
};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("DAG validation error: {0}")]
    Dag(#[from] DagValidationError),

    #[error("Failed to parse workflow definition: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Unknown workflow template: {0}")]
    TemplateNotFound(String),

    #[error("Workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Cannot {operation} run {run_id} while {state}")]
    InvalidState {
        run_id: Uuid,
        state: RunState,
        operation: &'static str,
    },

    #[error(transparent)]
    RunFailed(Box<RunFailure>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// The run failure, when the error came from executing a run
    pub fn run_failure(&self) -> Option<&RunFailure> {
        match self {
            WorkflowError::RunFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<RunFailure> for WorkflowError {
    fn from(failure: RunFailure) -> Self {
        WorkflowError::RunFailed(Box::new(failure))
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
