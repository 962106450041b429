//! Workflow run state and failure reporting

use crate::definition::WorkflowDefinition;
use crate::patterns::CompensationReport;
use chrono::{DateTime, Utc};
use pantheon_core::TaskError;
use pantheon_resilience::ResilienceError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    /// Sub-state of running: no new stages are dispatched
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// How a stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    /// Failed, but the error was recorded as its result
    Continued,
    /// Failed and was skipped
    Skipped,
    Failed,
}

/// Per-stage execution metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetrics {
    pub duration_ms: u64,
    pub success: bool,
    pub retries: u32,
    /// Worker that produced the final outcome
    pub worker: String,
    pub outcome: StageOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCounts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

impl ValidationCounts {
    pub fn record(&mut self, passed: bool) {
        self.total += 1;
        if passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn merge(&mut self, other: ValidationCounts) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
    }
}

/// Mutable execution instance of a definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_name: String,
    pub version: String,
    pub state: RunState,
    pub params: Map<String, Value>,
    pub total_stages: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completed_stages: BTreeSet<String>,
    pub failed_stages: BTreeSet<String>,
    pub stage_results: BTreeMap<String, Value>,
    pub stage_metrics: BTreeMap<String, StageMetrics>,
    /// Stages in the order they reached `completed_stages`
    pub completion_order: Vec<String>,
    pub validations: ValidationCounts,
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn new(definition: &WorkflowDefinition, params: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_name: definition.name.clone(),
            version: definition.version.clone(),
            state: RunState::Created,
            params,
            total_stages: definition.stages.len(),
            started_at: None,
            ended_at: None,
            completed_stages: BTreeSet::new(),
            failed_stages: BTreeSet::new(),
            stage_results: BTreeMap::new(),
            stage_metrics: BTreeMap::new(),
            completion_order: Vec::new(),
            validations: ValidationCounts::default(),
            error: None,
        }
    }

    /// Record a stage as done; a stage is recorded at most once.
    pub fn mark_completed(&mut self, stage: &str, result: Option<Value>) -> bool {
        if self.completed_stages.contains(stage) || self.failed_stages.contains(stage) {
            return false;
        }
        self.completed_stages.insert(stage.to_string());
        self.completion_order.push(stage.to_string());
        if let Some(result) = result {
            self.stage_results.insert(stage.to_string(), result);
        }
        true
    }

    /// Record a stage as failed; a stage is recorded at most once.
    pub fn mark_failed(&mut self, stage: &str) -> bool {
        if self.completed_stages.contains(stage) || self.failed_stages.contains(stage) {
            return false;
        }
        self.failed_stages.insert(stage.to_string());
        true
    }

    pub fn is_complete(&self) -> bool {
        self.completed_stages.len() == self.total_stages
    }

    /// Percentage of stages in a terminal state
    pub fn progress(&self) -> f64 {
        if self.total_stages == 0 {
            return 100.0;
        }
        let done = self.completed_stages.len() + self.failed_stages.len();
        (done as f64 / self.total_stages as f64) * 100.0
    }

    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let ended = self.ended_at.unwrap_or_else(Utc::now);
        (ended - started).to_std().ok()
    }
}

/// Why a stage did not succeed
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error("Stage timeout: {stage} after {}ms", .after.as_millis())]
    Timeout { stage: String, after: Duration },

    #[error("Stage {stage} failed: {source}")]
    Worker {
        stage: String,
        #[source]
        source: TaskError,
    },

    #[error("Stage {stage} failed gate: {gate}")]
    Gate { stage: String, gate: String },

    #[error("Stage {stage} failed success criteria: {reason}")]
    Criteria { stage: String, reason: String },

    #[error("Stage {stage} failed validation: {}", .issues.join("; "))]
    Validation { stage: String, issues: Vec<String> },

    #[error("Stage {stage} rejected: circuit breaker is OPEN for {worker}")]
    CircuitOpen { stage: String, worker: String },

    #[error("Stage {stage} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        stage: String,
        attempts: u32,
        #[source]
        source: Box<StageError>,
    },

    #[error("Stage {stage} fallback to {fallback_agent} failed: {source} (primary: {primary})")]
    Fallback {
        stage: String,
        fallback_agent: String,
        primary: Box<StageError>,
        #[source]
        source: Box<StageError>,
    },
}

impl StageError {
    pub fn stage(&self) -> &str {
        match self {
            StageError::Timeout { stage, .. }
            | StageError::Worker { stage, .. }
            | StageError::Gate { stage, .. }
            | StageError::Criteria { stage, .. }
            | StageError::Validation { stage, .. }
            | StageError::CircuitOpen { stage, .. }
            | StageError::RetryExhausted { stage, .. }
            | StageError::Fallback { stage, .. } => stage,
        }
    }

    /// Map a breaker/worker error for `stage`
    pub fn from_resilience(stage: &str, worker: &str, error: ResilienceError) -> Self {
        match error.root() {
            ResilienceError::CircuitOpen { .. } => StageError::CircuitOpen {
                stage: stage.to_string(),
                worker: worker.to_string(),
            },
            ResilienceError::Timeout { after } => StageError::Timeout {
                stage: stage.to_string(),
                after: *after,
            },
            ResilienceError::Operation(source) => StageError::Worker {
                stage: stage.to_string(),
                source: source.clone(),
            },
            other => StageError::Worker {
                stage: stage.to_string(),
                source: TaskError::new(other.to_string()),
            },
        }
    }

    /// The failure as a retry policy sees it.
    ///
    /// Gate, criteria and validation rejections, and errors that already
    /// wrap a retry or fallback, have no such form and are never retried.
    pub fn retry_error(&self) -> Option<ResilienceError> {
        match self {
            StageError::Timeout { after, .. } => Some(ResilienceError::Timeout { after: *after }),
            StageError::Worker { source, .. } => Some(ResilienceError::Operation(source.clone())),
            StageError::CircuitOpen { worker, .. } => Some(ResilienceError::CircuitOpen {
                name: worker.clone(),
            }),
            _ => None,
        }
    }

    /// True when the underlying failure is a validation rejection
    pub fn is_validation(&self) -> bool {
        match self {
            StageError::Validation { .. } => true,
            StageError::RetryExhausted { source, .. } | StageError::Fallback { source, .. } => {
                source.is_validation()
            }
            _ => false,
        }
    }

    /// Error descriptor recorded as the result of a `continue` stage
    pub fn to_value(&self) -> Value {
        let mut descriptor = serde_json::json!({
            "error": self.to_string(),
            "stage": self.stage(),
        });
        if let StageError::Worker { source, .. } = self {
            if let Some(code) = &source.code {
                descriptor["code"] = Value::String(code.clone());
            }
            if let Some(status) = source.status {
                descriptor["status"] = Value::from(status);
            }
        }
        descriptor
    }
}

/// What brought the run down
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FailureCause {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("Workflow timeout after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("Workflow stalled with stages pending: {}", .pending.join(", "))]
    Stalled { pending: Vec<String> },
}

/// Run-level failure: the triggering stage, the original error and what the
/// rollback managed to undo.
#[derive(Debug, Clone, Error)]
#[error("Workflow {workflow} failed: {cause}")]
pub struct RunFailure {
    pub run_id: Uuid,
    pub workflow: String,
    /// Stage that triggered the failure; `None` for a workflow timeout
    pub stage: Option<String>,
    #[source]
    pub cause: FailureCause,
    /// Present when the rollback policy ran
    pub compensation: Option<CompensationReport>,
}

impl RunFailure {
    pub fn compensated(&self) -> &[String] {
        self.compensation
            .as_ref()
            .map_or(&[], |report| report.compensated.as_slice())
    }

    /// Completed stages whose effects were not undone
    pub fn not_compensated(&self) -> Vec<String> {
        self.compensation
            .as_ref()
            .map(|report| report.not_compensated())
            .unwrap_or_default()
    }
}

/// Outcome of a run that finished without raising
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run: WorkflowRun,
    /// Failure accepted under the `continue` policy
    pub failure: Option<RunFailure>,
}

impl RunResult {
    pub fn is_completed(&self) -> bool {
        self.run.state == RunState::Completed
    }

    pub fn result(&self, stage: &str) -> Option<&Value> {
        self.run.stage_results.get(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StageSpec;
    use pantheon_resilience::classify::is_transient;

    fn run() -> WorkflowRun {
        let def = WorkflowDefinition::new("wf")
            .with_stage("a", StageSpec::new("w", "t"))
            .with_stage("b", StageSpec::new("w", "t"));
        WorkflowRun::new(&def, Map::new())
    }

    #[test]
    fn test_stage_recorded_once() {
        let mut run = run();

        assert!(run.mark_completed("a", Some(Value::from(1))));
        assert!(!run.mark_completed("a", Some(Value::from(2))));
        assert!(!run.mark_failed("a"));
        assert_eq!(run.stage_results["a"], Value::from(1));
        assert_eq!(run.completion_order, vec!["a"]);
        assert_eq!(run.progress(), 50.0);
        assert!(!run.is_complete());

        run.mark_completed("b", None);
        assert!(run.is_complete());
    }

    #[test]
    fn test_retryable_classification() {
        let timeout = StageError::Timeout {
            stage: "a".into(),
            after: Duration::from_secs(1),
        };
        let transient = StageError::Worker {
            stage: "a".into(),
            source: TaskError::new("rate limit exceeded"),
        };
        let permanent = StageError::Worker {
            stage: "a".into(),
            source: TaskError::new("bad request").with_status(400),
        };
        let gate = StageError::Gate {
            stage: "a".into(),
            gate: "severity < 3".into(),
        };

        let retryable = |error: &StageError| error.retry_error().is_some_and(|e| is_transient(&e));
        assert!(retryable(&timeout));
        assert!(retryable(&transient));
        assert!(!retryable(&permanent));
        assert!(!retryable(&gate));

        assert!(matches!(timeout.retry_error(), Some(ResilienceError::Timeout { .. })));
        assert!(matches!(permanent.retry_error(), Some(ResilienceError::Operation(_))));
        assert!(gate.retry_error().is_none());
    }

    #[test]
    fn test_validation_detection_through_wrappers() {
        let err = StageError::RetryExhausted {
            stage: "a".into(),
            attempts: 2,
            source: Box::new(StageError::Validation {
                stage: "a".into(),
                issues: vec!["unsafe".into()],
            }),
        };
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "Stage a failed after 2 attempts: Stage a failed validation: unsafe"
        );
    }

    #[test]
    fn test_error_descriptor() {
        let err = StageError::Worker {
            stage: "docs".into(),
            source: TaskError::new("boom").with_status(500),
        };
        let value = err.to_value();

        assert_eq!(value["stage"], "docs");
        assert_eq!(value["error"], "Stage docs failed: boom");
        assert_eq!(value["status"], 500);
    }

    #[test]
    fn test_breaker_errors_map_to_stage_errors() {
        let err = StageError::from_resilience(
            "build",
            "compiler",
            ResilienceError::CircuitOpen {
                name: "compiler".into(),
            },
        );
        assert!(matches!(err, StageError::CircuitOpen { .. }));
        assert!(!is_transient(&err.retry_error().unwrap()));
    }
}
