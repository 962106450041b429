//! Collaborators the engine dispatches to: workers and the result validator.

use async_trait::async_trait;
use pantheon_core::{TaskError, ValidationMode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a worker receives for one stage attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTask {
    pub task_type: String,
    pub workflow_name: String,
    pub run_id: Uuid,
    pub stage: String,
    pub task: String,
    /// Stage params
    pub params: Map<String, Value>,
    /// Run parameters
    pub context: Map<String, Value>,
    /// Results of the declared dependencies
    pub previous_results: BTreeMap<String, Value>,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Performs the work of a stage.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, task: StageTask) -> Result<Value, TaskError>;
}

pub type SharedWorker = Arc<dyn Worker>;

/// Adapter turning an async closure into a [`Worker`]
pub struct FnWorker<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(StageTask) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    async fn execute(&self, task: StageTask) -> Result<Value, TaskError> {
        (self.f)(task).await
    }
}

/// Wrap an async closure as a shared worker
pub fn worker_fn<F, Fut>(f: F) -> SharedWorker
where
    F: Fn(StageTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(FnWorker { f })
}

/// Workers by name
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, SharedWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, worker: SharedWorker) {
        self.workers.insert(name.into(), worker);
    }

    pub fn get(&self, name: &str) -> Option<SharedWorker> {
        self.workers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// What the validator is asked to check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationProfile {
    pub workflow: String,
    pub stage: String,
    pub task_type: String,
    pub mode: ValidationMode,
}

/// Validator verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl ValidationReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            issues: Vec::new(),
        }
    }

    pub fn fail(issues: Vec<String>) -> Self {
        Self {
            passed: false,
            issues,
        }
    }
}

/// External check of a stage result
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        result: &Value,
        profile: &ValidationProfile,
    ) -> Result<ValidationReport, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> StageTask {
        StageTask {
            task_type: "generic".into(),
            workflow_name: "wf".into(),
            run_id: Uuid::new_v4(),
            stage: "build".into(),
            task: "compile".into(),
            params: Map::new(),
            context: Map::new(),
            previous_results: BTreeMap::new(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_fn_worker() {
        let worker = worker_fn(|task: StageTask| async move {
            Ok(json!({ "stage": task.stage, "attempt": task.attempt }))
        });

        let value = worker.execute(task()).await.unwrap();
        assert_eq!(value, json!({"stage": "build", "attempt": 1}));
    }

    #[test]
    fn test_registry() {
        let mut registry = WorkerRegistry::new();
        registry.register("b", worker_fn(|_| async { Ok(Value::Null) }));
        registry.register("a", worker_fn(|_| async { Ok(Value::Null) }));

        assert!(registry.contains("a"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_mock_validator() {
        let mut validator = MockValidator::new();
        validator
            .expect_validate()
            .withf(|result, profile| result["ok"] == json!(true) && profile.stage == "build")
            .returning(|_, _| Ok(ValidationReport::pass()));

        let profile = ValidationProfile {
            workflow: "wf".into(),
            stage: "build".into(),
            task_type: "generic".into(),
            mode: ValidationMode::Strict,
        };

        let report = validator.validate(&json!({"ok": true}), &profile).await.unwrap();
        assert!(report.passed);
    }
}
