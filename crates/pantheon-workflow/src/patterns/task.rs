//! The single task capability the patterns operate on.

use async_trait::async_trait;
use pantheon_core::TaskError;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Named unit of work: `execute(input) -> output`
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, input: Value) -> Result<Value, TaskError>;

    /// `execute` with a token that is cancelled once the result is no longer
    /// wanted. Observing it is optional; the default ignores it.
    async fn execute_cancellable(
        &self,
        input: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, TaskError> {
        self.execute(input).await
    }
}

pub type SharedTask = Arc<dyn Task>;

/// Adapter turning an async closure into a [`Task`]
pub struct FnTask<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Value) -> Result<Value, TaskError> {
        (self.f)(input).await
    }
}

/// Wrap an async closure as a named shared task
pub fn task_fn<F, Fut>(name: impl Into<String>, f: F) -> SharedTask
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(FnTask {
        name: name.into(),
        f,
    })
}

/// A task plus the flags patterns honour
#[derive(Clone)]
pub struct TaskSpec {
    pub task: SharedTask,
    /// Sequential: a result with `"success": false` aborts the remainder
    pub terminate_on_failure: bool,
    /// Conditional/saga: merge an object result into the context
    pub update_context: bool,
    /// Pipeline: an empty output ends the pipeline early
    pub terminate_on_empty: bool,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("task", &self.task.name())
            .field("terminate_on_failure", &self.terminate_on_failure)
            .field("update_context", &self.update_context)
            .field("terminate_on_empty", &self.terminate_on_empty)
            .finish()
    }
}

impl TaskSpec {
    pub fn new(task: SharedTask) -> Self {
        Self {
            task,
            terminate_on_failure: false,
            update_context: false,
            terminate_on_empty: false,
        }
    }

    pub fn terminate_on_failure(mut self) -> Self {
        self.terminate_on_failure = true;
        self
    }

    pub fn update_context(mut self) -> Self {
        self.update_context = true;
        self
    }

    pub fn terminate_on_empty(mut self) -> Self {
        self.terminate_on_empty = true;
        self
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }
}

impl From<SharedTask> for TaskSpec {
    fn from(task: SharedTask) -> Self {
        Self::new(task)
    }
}

/// Context object with extra keys merged in.
///
/// A non-object context is kept under `"context"`.
pub(crate) fn with_keys<I>(context: &Value, keys: I) -> Value
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    let mut input = match context {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("context".to_string(), other.clone());
            map
        }
    };
    for (key, value) in keys {
        input.insert(key.to_string(), value);
    }
    Value::Object(input)
}

/// Merge an object `result` into `context`; other results are ignored.
pub(crate) fn merge_context(context: &mut Value, result: &Value) {
    let Value::Object(update) = result else {
        return;
    };
    if !context.is_object() {
        *context = Value::Object(Map::new());
    }
    if let Value::Object(map) = context {
        for (key, value) in update {
            map.insert(key.clone(), value.clone());
        }
    }
}

/// Null, empty objects, empty arrays and empty strings count as empty
pub(crate) fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_task_fn() {
        let task = task_fn("double", |input: Value| async move {
            let n = input["n"].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        });

        assert_eq!(task.name(), "double");
        assert_eq!(task.execute(json!({"n": 21})).await.unwrap(), json!(42));
    }

    #[test]
    fn test_context_helpers() {
        let input = with_keys(&json!({"user": "ada"}), [("sequence_index", json!(2))]);
        assert_eq!(input, json!({"user": "ada", "sequence_index": 2}));

        let wrapped = with_keys(&json!(7), [("data", json!([1]))]);
        assert_eq!(wrapped, json!({"context": 7, "data": [1]}));

        let mut context = json!({"a": 1});
        merge_context(&mut context, &json!({"b": 2}));
        merge_context(&mut context, &json!("ignored"));
        assert_eq!(context, json!({"a": 1, "b": 2}));

        assert!(is_empty(&json!({})));
        assert!(!is_empty(&json!(0)));
    }
}
