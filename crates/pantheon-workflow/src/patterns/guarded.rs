//! Guarded single-task patterns: retry and circuit breaker

use super::task::with_keys;
use super::{ExecutionPatterns, PatternError, PatternKind, PatternResult, SharedTask, TaskOutcome};
use pantheon_resilience::RetryPolicy;
use serde_json::{json, Value};

impl ExecutionPatterns {
    /// Run `task` under `policy`; each input carries `retry_attempt`.
    pub async fn retry(
        &self,
        task: &SharedTask,
        context: Value,
        policy: &RetryPolicy,
    ) -> Result<PatternResult, PatternError> {
        let execution = self.begin(
            PatternKind::Retry,
            json!({ "task_name": task.name(), "max_retries": policy.config().max_retries }),
        );

        let running = &execution;
        let mut attempts = 0;
        let outcome = policy
            .execute(|attempt| {
                attempts = attempt;
                let input = with_keys(&context, [("retry_attempt", json!(attempt))]);
                async move { running.run_task(0, task, input).await.result }
            })
            .await;

        match outcome {
            Ok(value) => {
                let mut result = execution.result(vec![TaskOutcome {
                    index: 0,
                    name: task.name().to_string(),
                    result: Ok(value.clone()),
                }]);
                result.output = Some(value);
                result.attempts = Some(attempts);
                execution.complete(result)
            }
            Err(error) => execution.fail(error.into()),
        }
    }

    /// Run `task` through the breaker keyed by its name.
    ///
    /// Breakers come from the pattern registry with its defaults; configure a
    /// key up front with [`CircuitBreakerRegistry::get_with`].
    ///
    /// [`CircuitBreakerRegistry::get_with`]: pantheon_resilience::CircuitBreakerRegistry::get_with
    pub async fn circuit_breaker(
        &self,
        task: &SharedTask,
        context: Value,
    ) -> Result<PatternResult, PatternError> {
        let breaker = self.breakers.get(task.name());
        let execution = self.begin(
            PatternKind::CircuitBreaker,
            json!({ "task_name": task.name(), "breaker_state": breaker.state() }),
        );

        let running = &execution;
        let outcome = breaker
            .execute(move || async move { running.run_task(0, task, context).await.result })
            .await;

        match outcome {
            Ok(value) => {
                let mut result = execution.result(vec![TaskOutcome {
                    index: 0,
                    name: task.name().to_string(),
                    result: Ok(value.clone()),
                }]);
                result.output = Some(value);
                result.breaker_state = Some(breaker.state());
                execution.complete(result)
            }
            Err(error) => execution.fail(error.into()),
        }
    }
}
