//! Ordered patterns: sequential, conditional and pipeline

use super::task::{is_empty, merge_context, with_keys};
use super::{task_error, ExecutionPatterns, PatternError, PatternKind, PatternResult, TaskSpec};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Branch selector for [`ExecutionPatterns::conditional`]
#[derive(Clone)]
pub enum Condition {
    Value(bool),
    /// Truthiness of a context field
    Key(String),
    Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Condition::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Condition::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl Condition {
    pub fn key(key: impl Into<String>) -> Self {
        Condition::Key(key.into())
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Condition::Predicate(Arc::new(predicate))
    }

    pub fn evaluate(&self, context: &Value) -> bool {
        match self {
            Condition::Value(value) => *value,
            Condition::Key(key) => context.get(key).map_or(false, truthy),
            Condition::Predicate(predicate) => predicate(context),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl ExecutionPatterns {
    /// Run tasks in order, feeding each the previous result.
    ///
    /// Each input is the context plus `previous_result` and `sequence_index`.
    /// A failing task aborts the remainder; so does a `terminate_on_failure`
    /// task whose result carries `"success": false`.
    pub async fn sequential(
        &self,
        tasks: &[TaskSpec],
        context: Value,
    ) -> Result<PatternResult, PatternError> {
        let execution = self.begin(
            PatternKind::Sequential,
            json!({ "task_count": tasks.len() }),
        );
        let mut results = Vec::with_capacity(tasks.len());
        let mut previous = Value::Null;

        for (index, spec) in tasks.iter().enumerate() {
            let input = with_keys(
                &context,
                [
                    ("previous_result", previous.clone()),
                    ("sequence_index", json!(index)),
                ],
            );
            let outcome = execution.run_task(index, &spec.task, input).await;
            if let Some(error) = task_error(&outcome) {
                return execution.fail(error);
            }

            let value = outcome.value().cloned().unwrap_or_default();
            results.push(outcome);

            if spec.terminate_on_failure && value.get("success") == Some(&Value::Bool(false)) {
                return execution.fail(PatternError::Terminated {
                    index,
                    task: spec.name().to_string(),
                });
            }
            previous = value;
        }

        let result = execution.result(results);
        execution.complete(result)
    }

    /// Evaluate `condition` once, run the chosen branch, then `always`.
    pub async fn conditional(
        &self,
        condition: &Condition,
        when_true: &[TaskSpec],
        when_false: &[TaskSpec],
        always: &[TaskSpec],
        context: Value,
    ) -> Result<PatternResult, PatternError> {
        let execution = self.begin(PatternKind::Conditional, json!({}));
        let branch = condition.evaluate(&context);
        let chosen = if branch { when_true } else { when_false };

        let mut context = context;
        let mut results = Vec::new();

        for (index, spec) in chosen.iter().chain(always).enumerate() {
            let outcome = execution.run_task(index, &spec.task, context.clone()).await;
            if let Some(error) = task_error(&outcome) {
                return execution.fail(error);
            }
            if spec.update_context {
                if let Some(value) = outcome.value() {
                    merge_context(&mut context, value);
                }
            }
            results.push(outcome);
        }

        let mut result = execution.result(results);
        result.branch = Some(branch);
        execution.complete(result)
    }

    /// Thread one value through ordered stages.
    ///
    /// Each stage sees the context plus `data` (the previous output) and
    /// `stage_index`; its output becomes the next `data`.
    pub async fn pipeline(
        &self,
        stages: &[TaskSpec],
        initial: Value,
        context: Value,
    ) -> Result<PatternResult, PatternError> {
        let execution = self.begin(
            PatternKind::Pipeline,
            json!({ "stage_count": stages.len() }),
        );
        let mut data = initial;
        let mut results = Vec::with_capacity(stages.len());

        for (index, spec) in stages.iter().enumerate() {
            let input = with_keys(
                &context,
                [("data", data.clone()), ("stage_index", json!(index))],
            );
            let outcome = execution.run_task(index, &spec.task, input).await;
            if let Some(error) = task_error(&outcome) {
                return execution.fail(error);
            }

            data = outcome.value().cloned().unwrap_or_default();
            results.push(outcome);

            if spec.terminate_on_empty && is_empty(&data) {
                break;
            }
        }

        let mut result = execution.result(results);
        result.output = Some(data);
        execution.complete(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::task_fn;
    use pantheon_core::TaskError;
    use parking_lot::Mutex;

    fn recorder(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> TaskSpec {
        TaskSpec::new(task_fn(name, move |input: Value| {
            let log = log.clone();
            async move {
                log.lock().push(name.to_string());
                Ok(json!({ "from": name, "seen": input }))
            }
        }))
    }

    #[tokio::test]
    async fn test_sequential_passes_previous_result() {
        let patterns = ExecutionPatterns::new();
        let tasks = vec![
            TaskSpec::new(task_fn("one", |_| async { Ok(json!(1)) })),
            TaskSpec::new(task_fn("two", |input: Value| async move {
                let previous = input["previous_result"].as_i64().unwrap_or_default();
                Ok(json!(previous + input["sequence_index"].as_i64().unwrap_or_default()))
            })),
        ];

        let result = patterns.sequential(&tasks, json!({"user": "ada"})).await.unwrap();

        assert!(result.success);
        assert_eq!(result.values(), vec![&json!(1), &json!(2)]);
    }

    #[tokio::test]
    async fn test_sequential_stops_at_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let patterns = ExecutionPatterns::new();
        let tasks = vec![
            recorder("a", log.clone()),
            TaskSpec::new(task_fn("b", |_| async { Err(TaskError::new("boom")) })),
            recorder("c", log.clone()),
        ];

        let err = patterns.sequential(&tasks, json!({})).await.unwrap_err();

        assert!(matches!(err, PatternError::Task { ref task, .. } if task == "b"));
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_sequential_terminate_on_failure_flag() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let patterns = ExecutionPatterns::new();
        let tasks = vec![
            TaskSpec::new(task_fn("check", |_| async { Ok(json!({"success": false})) }))
                .terminate_on_failure(),
            recorder("after", log.clone()),
        ];

        let err = patterns.sequential(&tasks, json!({})).await.unwrap_err();

        assert!(matches!(err, PatternError::Terminated { index: 0, .. }));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_branches() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let patterns = ExecutionPatterns::new();
        let when_true = vec![recorder("yes", log.clone())];
        let when_false = vec![recorder("no", log.clone())];
        let always = vec![recorder("cleanup", log.clone())];

        let result = patterns
            .conditional(
                &Condition::key("deploy"),
                &when_true,
                &when_false,
                &always,
                json!({"deploy": false}),
            )
            .await
            .unwrap();

        assert_eq!(result.branch, Some(false));
        assert_eq!(*log.lock(), vec!["no", "cleanup"]);
    }

    #[tokio::test]
    async fn test_conditional_updates_context() {
        let patterns = ExecutionPatterns::new();
        let when_true = vec![
            TaskSpec::new(task_fn("login", |_| async { Ok(json!({"token": "t-1"})) }))
                .update_context(),
            TaskSpec::new(task_fn("use", |input: Value| async move { Ok(input["token"].clone()) })),
        ];

        let result = patterns
            .conditional(
                &Condition::predicate(|ctx| ctx["n"].as_i64() > Some(1)),
                &when_true,
                &[],
                &[],
                json!({"n": 2}),
            )
            .await
            .unwrap();

        assert_eq!(result.values().last(), Some(&&json!("t-1")));
    }

    #[tokio::test]
    async fn test_pipeline_threads_data() {
        let patterns = ExecutionPatterns::new();
        let stages = vec![
            TaskSpec::new(task_fn("double", |input: Value| async move {
                Ok(json!(input["data"].as_i64().unwrap_or_default() * 2))
            })),
            TaskSpec::new(task_fn("inc", |input: Value| async move {
                Ok(json!(input["data"].as_i64().unwrap_or_default() + 1))
            })),
        ];

        let result = patterns.pipeline(&stages, json!(5), json!({})).await.unwrap();

        assert_eq!(result.output, Some(json!(11)));
        assert_eq!(result.results.len(), 2);
    }

    #[tokio::test]
    async fn test_pipeline_terminates_on_empty() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let patterns = ExecutionPatterns::new();
        let stages = vec![
            TaskSpec::new(task_fn("filter", |_| async { Ok(json!([])) })).terminate_on_empty(),
            recorder("never", log.clone()),
        ];

        let result = patterns.pipeline(&stages, json!([1, 2]), json!({})).await.unwrap();

        assert_eq!(result.output, Some(json!([])));
        assert!(log.lock().is_empty());
    }
}
