//! Concurrent patterns: parallel, fan-out, fan-in and race

use super::task::with_keys;
use super::{
    task_error, ExecutionPatterns, PatternError, PatternKind, PatternResult, SharedTask,
    TaskOutcome, TaskSpec,
};
use futures::future::try_join_all;
use futures::{FutureExt, StreamExt};
use pantheon_core::TaskError;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Options for [`ExecutionPatterns::parallel`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelOptions {
    /// Defaults to the number of tasks
    pub max_concurrency: Option<usize>,
    /// Stop on the first failure instead of collecting every outcome
    pub fail_fast: bool,
}

impl ParallelOptions {
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

impl ExecutionPatterns {
    /// Run tasks with at most `max_concurrency` in flight.
    ///
    /// Without `fail_fast` every outcome is collected and `success` reports
    /// whether all of them succeeded. With it, the first failure drops the
    /// outstanding work and is returned. Results are ordered by task index.
    pub async fn parallel(
        &self,
        tasks: &[TaskSpec],
        context: Value,
        options: ParallelOptions,
    ) -> Result<PatternResult, PatternError> {
        let limit = options.max_concurrency.unwrap_or(tasks.len()).max(1);
        let execution = self.begin(
            PatternKind::Parallel,
            json!({ "task_count": tasks.len(), "max_concurrency": limit }),
        );

        let running = &execution;
        let context = &context;
        let mut outcomes = futures::stream::iter(tasks.iter().enumerate())
            .map(|(index, spec)| running.run_task(index, &spec.task, context.clone()))
            .buffer_unordered(limit);

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(outcome) = outcomes.next().await {
            if options.fail_fast {
                if let Some(error) = task_error(&outcome) {
                    drop(outcomes);
                    return execution.fail(error);
                }
            }
            results.push(outcome);
        }
        drop(outcomes);

        results.sort_by_key(|outcome| outcome.index);
        let result = execution.result(results);
        execution.complete(result)
    }

    /// Split `data` with `distributor` and run each worker on its share.
    ///
    /// Worker `i` sees the context plus `data` (its chunk, or an empty array
    /// when the distributor produced fewer chunks) and `worker_index`.
    pub async fn fan_out<D>(
        &self,
        distributor: D,
        workers: &[SharedTask],
        data: Value,
        context: Value,
    ) -> Result<PatternResult, PatternError>
    where
        D: Fn(&Value, usize) -> Vec<Value>,
    {
        let execution = self.begin(
            PatternKind::FanOut,
            json!({ "worker_count": workers.len() }),
        );
        let chunks = distributor(&data, workers.len());

        let running = &execution;
        let runs = workers.iter().enumerate().map(|(index, worker)| {
            let chunk = chunks
                .get(index)
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new()));
            let input = with_keys(&context, [("data", chunk), ("worker_index", json!(index))]);
            async move {
                let outcome = running.run_task(index, worker, input).await;
                match task_error(&outcome) {
                    Some(error) => Err(error),
                    None => Ok(outcome),
                }
            }
        });
        let joined = try_join_all(runs).await;

        match joined {
            Ok(results) => {
                let result = execution.result(results);
                execution.complete(result)
            }
            Err(error) => execution.fail(error),
        }
    }

    /// Run every source concurrently, then combine their results.
    pub async fn fan_in<A>(
        &self,
        sources: &[SharedTask],
        aggregator: A,
        context: Value,
    ) -> Result<PatternResult, PatternError>
    where
        A: FnOnce(Vec<Value>, &Value) -> Result<Value, TaskError>,
    {
        let execution = self.begin(
            PatternKind::FanIn,
            json!({ "source_count": sources.len() }),
        );

        let running = &execution;
        let runs = sources.iter().enumerate().map(|(index, source)| {
            let input = context.clone();
            async move {
                let outcome = running.run_task(index, source, input).await;
                match task_error(&outcome) {
                    Some(error) => Err(error),
                    None => Ok(outcome),
                }
            }
        });
        let joined = try_join_all(runs).await;

        let results = match joined {
            Ok(results) => results,
            Err(error) => return execution.fail(error),
        };

        let values = results
            .iter()
            .filter_map(|outcome| outcome.value().cloned())
            .collect();
        match aggregator(values, &context) {
            Ok(aggregate) => {
                let mut result = execution.result(results);
                result.output = Some(aggregate);
                execution.complete(result)
            }
            Err(source) => execution.fail(PatternError::Task {
                task: "aggregator".to_string(),
                source,
            }),
        }
    }

    /// Start every competitor; the first success wins.
    ///
    /// Losers are signalled through the token handed to
    /// [`Task::execute_cancellable`](super::Task::execute_cancellable) and
    /// detached. A loser that ignores the signal runs to completion and its
    /// result is discarded.
    pub async fn race(
        &self,
        competitors: &[SharedTask],
        context: Value,
    ) -> Result<PatternResult, PatternError> {
        if competitors.is_empty() {
            return Err(PatternError::InvalidInput(
                "race needs at least one competitor".to_string(),
            ));
        }

        let execution = self.begin(
            PatternKind::Race,
            json!({ "competitor_count": competitors.len() }),
        );
        let token = CancellationToken::new();
        let mut set = JoinSet::new();

        for (index, competitor) in competitors.iter().enumerate() {
            execution.task_started(index, competitor.name());

            let competitor = competitor.clone();
            let input = context.clone();
            let token = token.child_token();
            set.spawn(async move {
                let outcome = AssertUnwindSafe(competitor.execute_cancellable(input, token))
                    .catch_unwind()
                    .await;
                let result = outcome.unwrap_or_else(|_| {
                    Err(TaskError::new(format!("competitor {} panicked", competitor.name())))
                });
                (index, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (index, result) = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    warn!(error = %e, "Race competitor did not finish");
                    continue;
                }
            };

            let name = competitors[index].name();
            execution.task_finished(index, name, &result);

            match result {
                Ok(value) => {
                    token.cancel();
                    set.detach_all();

                    let mut result = execution.result(vec![TaskOutcome {
                        index,
                        name: name.to_string(),
                        result: Ok(value.clone()),
                    }]);
                    result.output = Some(value);
                    result.winner = Some(name.to_string());
                    return execution.complete(result);
                }
                Err(e) => failures.push((name.to_string(), e)),
            }
        }

        execution.fail(PatternError::AllCompetitorsFailed { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{chunk_distributor, task_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn sleeper(name: &'static str, ms: u64, active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> TaskSpec {
        TaskSpec::new(task_fn(name, move |_| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(name))
            }
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_respects_concurrency_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|name| sleeper(name, 100, active.clone(), peak.clone()))
            .collect();

        let result = ExecutionPatterns::new()
            .parallel(&tasks, json!({}), ParallelOptions::default().max_concurrency(2))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        let names: Vec<_> = result.results.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_parallel_collects_failures() {
        let tasks = vec![
            TaskSpec::new(task_fn("ok", |_| async { Ok(json!(1)) })),
            TaskSpec::new(task_fn("bad", |_| async { Err(TaskError::new("nope")) })),
        ];

        let result = ExecutionPatterns::new()
            .parallel(&tasks, json!({}), ParallelOptions::default())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.values(), vec![&json!(1)]);
        assert!(result.results[1].result.is_err());
    }

    #[tokio::test]
    async fn test_parallel_fail_fast() {
        let tasks = vec![TaskSpec::new(task_fn("bad", |_| async { Err(TaskError::new("nope")) }))];

        let err = ExecutionPatterns::new()
            .parallel(&tasks, json!({}), ParallelOptions::default().fail_fast())
            .await
            .unwrap_err();

        assert!(matches!(err, PatternError::Task { ref task, .. } if task == "bad"));
    }

    #[tokio::test]
    async fn test_fan_out_distributes_chunks() {
        let sum = task_fn("sum", |input: Value| async move {
            let total: i64 = input["data"]
                .as_array()
                .map(|items| items.iter().filter_map(Value::as_i64).sum())
                .unwrap_or_default();
            Ok(json!({ "worker": input["worker_index"], "total": total }))
        });
        let workers = vec![sum.clone(), sum.clone(), sum];

        let result = ExecutionPatterns::new()
            .fan_out(chunk_distributor, &workers, json!([1, 2, 3, 4]), json!({}))
            .await
            .unwrap();

        let totals: Vec<_> = result.values().iter().map(|v| v["total"].clone()).collect();
        assert_eq!(totals, vec![json!(3), json!(7), json!(0)]);
    }

    #[tokio::test]
    async fn test_fan_in_aggregates() {
        let sources = vec![
            task_fn("left", |_| async { Ok(json!(2)) }),
            task_fn("right", |_| async { Ok(json!(3)) }),
        ];

        let result = ExecutionPatterns::new()
            .fan_in(
                &sources,
                |values, _context| Ok(json!(values.iter().filter_map(Value::as_i64).sum::<i64>())),
                json!({}),
            )
            .await
            .unwrap();

        assert_eq!(result.output, Some(json!(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_first_success_wins() {
        let competitors = vec![
            task_fn("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("slow"))
            }),
            task_fn("broken", |_| async { Err(TaskError::new("down")) }),
            task_fn("fast", |_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("fast"))
            }),
        ];

        let result = ExecutionPatterns::new()
            .race(&competitors, json!({}))
            .await
            .unwrap();

        assert_eq!(result.winner.as_deref(), Some("fast"));
        assert_eq!(result.output, Some(json!("fast")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_losers_run_to_completion() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let competitors = vec![
            task_fn("fast", |_| async { Ok(json!("fast")) }),
            task_fn("slow", move |_| {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("slow"))
                }
            }),
        ];

        let result = ExecutionPatterns::new()
            .race(&competitors, json!({}))
            .await
            .unwrap();
        assert_eq!(result.winner.as_deref(), Some("fast"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(result.results.len(), 1);
    }

    struct Polite {
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl crate::patterns::Task for Polite {
        fn name(&self) -> &str {
            "polite"
        }

        async fn execute(&self, _input: Value) -> Result<Value, TaskError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!("polite"))
        }

        async fn execute_cancellable(
            &self,
            input: Value,
            cancel: CancellationToken,
        ) -> Result<Value, TaskError> {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stopped.fetch_add(1, Ordering::SeqCst);
                    Err(TaskError::new("cancelled"))
                }
                result = self.execute(input) => result,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_signals_losers_that_listen() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let competitors: Vec<SharedTask> = vec![
            Arc::new(Polite {
                stopped: stopped.clone(),
            }),
            task_fn("fast", |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!("fast"))
            }),
        ];

        let result = ExecutionPatterns::new()
            .race(&competitors, json!({}))
            .await
            .unwrap();
        assert_eq!(result.winner.as_deref(), Some("fast"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_race_all_fail() {
        let competitors = vec![
            task_fn("a", |_| async { Err(TaskError::new("a down")) }),
            task_fn("b", |_| async { Err(TaskError::new("b down")) }),
        ];

        let err = ExecutionPatterns::new()
            .race(&competitors, json!({}))
            .await
            .unwrap_err();

        match err {
            PatternError::AllCompetitorsFailed { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
    }
}
