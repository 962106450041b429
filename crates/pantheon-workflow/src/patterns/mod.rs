//! Execution patterns
//!
//! Reusable strategies over lists of [`Task`]s: ordered flows (sequential,
//! conditional, pipeline), concurrent flows (parallel, fan-out, fan-in, race),
//! guarded calls (retry, circuit breaker) and sagas with compensation.
//!
//! Every pattern gets its own execution id and publishes `pattern.*` events to
//! the configured sink. Cancellation of concurrent work is cooperative: losers
//! of a race are signalled, not killed.

mod concurrent;
mod flow;
mod guarded;
mod saga;
mod task;

pub use concurrent::ParallelOptions;
pub use flow::Condition;
pub use saga::{unwind, CompensationReport, CompletedStep, SagaStep};
pub use task::{task_fn, FnTask, SharedTask, Task, TaskSpec};

use pantheon_core::{event_types, Event, NoopSink, SharedSink, TaskError};
use pantheon_resilience::{BreakerStatus, CircuitBreakerRegistry, CircuitState, ResilienceError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Known patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Sequential,
    Parallel,
    Conditional,
    Pipeline,
    FanOut,
    FanIn,
    Race,
    Retry,
    CircuitBreaker,
    Saga,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Sequential => "sequential",
            PatternKind::Parallel => "parallel",
            PatternKind::Conditional => "conditional",
            PatternKind::Pipeline => "pipeline",
            PatternKind::FanOut => "fan_out",
            PatternKind::FanIn => "fan_in",
            PatternKind::Race => "race",
            PatternKind::Retry => "retry",
            PatternKind::CircuitBreaker => "circuit_breaker",
            PatternKind::Saga => "saga",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(PatternKind::Sequential),
            "parallel" => Ok(PatternKind::Parallel),
            "conditional" => Ok(PatternKind::Conditional),
            "pipeline" => Ok(PatternKind::Pipeline),
            "fan_out" => Ok(PatternKind::FanOut),
            "fan_in" => Ok(PatternKind::FanIn),
            "race" => Ok(PatternKind::Race),
            "retry" => Ok(PatternKind::Retry),
            "circuit_breaker" => Ok(PatternKind::CircuitBreaker),
            "saga" => Ok(PatternKind::Saga),
            other => Err(PatternError::InvalidInput(format!("unknown pattern: {}", other))),
        }
    }
}

/// Outcome of one task inside a pattern
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    /// Position of the task in the input list
    pub index: usize,
    pub name: String,
    pub result: Result<Value, TaskError>,
}

impl TaskOutcome {
    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// What a pattern returns when it does not raise
#[derive(Debug, Clone)]
pub struct PatternResult {
    pub execution_id: Uuid,
    pub pattern: PatternKind,
    /// False when collected outcomes include failures
    pub success: bool,
    pub results: Vec<TaskOutcome>,
    /// Pipeline output, fan-in aggregate, race winner value or guarded result
    pub output: Option<Value>,
    /// Conditional branch taken
    pub branch: Option<bool>,
    /// Name of the race winner
    pub winner: Option<String>,
    /// Attempts used by the retry pattern
    pub attempts: Option<u32>,
    pub breaker_state: Option<CircuitState>,
    pub duration: Duration,
}

impl PatternResult {
    /// Successful result values in `results` order
    pub fn values(&self) -> Vec<&Value> {
        self.results.iter().filter_map(TaskOutcome::value).collect()
    }
}

#[derive(Debug, Clone, Error)]
pub enum PatternError {
    #[error("Task {task} failed: {source}")]
    Task {
        task: String,
        #[source]
        source: TaskError,
    },

    #[error("Execution terminated at task {index}: {task}")]
    Terminated { index: usize, task: String },

    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error("Saga aborted at step {step}: {source}")]
    SagaAborted {
        step: String,
        #[source]
        source: TaskError,
        report: CompensationReport,
    },

    #[error("All {} competitors failed", .failures.len())]
    AllCompetitorsFailed { failures: Vec<(String, TaskError)> },

    #[error("Invalid pattern input: {0}")]
    InvalidInput(String),
}

/// Snapshot returned by [`ExecutionPatterns::statistics`]
#[derive(Debug, Clone, Serialize)]
pub struct PatternStatistics {
    pub active_executions: usize,
    pub finished_executions: u64,
    pub breakers: BTreeMap<String, BreakerStatus>,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    finished: AtomicU64,
}

/// Executes the patterns; clones share breakers and statistics.
#[derive(Clone)]
pub struct ExecutionPatterns {
    events: SharedSink,
    breakers: CircuitBreakerRegistry,
    counters: Arc<Counters>,
}

impl Default for ExecutionPatterns {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionPatterns {
    pub fn new() -> Self {
        Self::with_events(NoopSink::shared())
    }

    /// Publish pattern and breaker events to `events`
    pub fn with_events(events: SharedSink) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::with_events(Default::default(), events.clone()),
            events,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Use an existing breaker registry for the circuit breaker pattern
    pub fn with_breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn statistics(&self) -> PatternStatistics {
        PatternStatistics {
            active_executions: self.counters.active.load(Ordering::SeqCst),
            finished_executions: self.counters.finished.load(Ordering::SeqCst),
            breakers: self.breakers.statuses(),
        }
    }

    fn begin(&self, pattern: PatternKind, details: Value) -> Execution<'_> {
        let execution = Execution {
            id: Uuid::new_v4(),
            pattern,
            started: Instant::now(),
            patterns: self,
        };
        self.counters.active.fetch_add(1, Ordering::SeqCst);

        debug!(pattern = %pattern, execution_id = %execution.id, "Pattern started");
        let mut payload = execution.payload();
        if let (Value::Object(payload), Value::Object(details)) = (&mut payload, details) {
            payload.extend(details);
        }
        self.events.emit(Event::new(event_types::PATTERN_STARTED, payload));

        execution
    }
}

/// Default fan-out distributor: slices an array into `ceil(len / n)`-sized
/// chunks. Anything else goes whole to the first worker.
pub fn chunk_distributor(data: &Value, workers: usize) -> Vec<Value> {
    let workers = workers.max(1);
    match data {
        Value::Array(items) => {
            let size = ((items.len() + workers - 1) / workers).max(1);
            items
                .chunks(size)
                .map(|chunk| Value::Array(chunk.to_vec()))
                .collect()
        }
        other => vec![other.clone()],
    }
}

/// One running pattern; reports itself finished when dropped.
struct Execution<'a> {
    id: Uuid,
    pattern: PatternKind,
    started: Instant,
    patterns: &'a ExecutionPatterns,
}

impl Execution<'_> {
    fn payload(&self) -> Value {
        json!({
            "pattern": self.pattern,
            "execution_id": self.id,
        })
    }

    fn emit(&self, event_type: &str, details: Value) {
        let mut payload = self.payload();
        if let (Value::Object(payload), Value::Object(details)) = (&mut payload, details) {
            payload.extend(details);
        }
        self.patterns.events.emit(Event::new(event_type, payload));
    }

    fn events(&self) -> &SharedSink {
        &self.patterns.events
    }

    /// Run one task, publishing task events around it
    async fn run_task(&self, index: usize, task: &SharedTask, input: Value) -> TaskOutcome {
        self.task_started(index, task.name());
        let result = task.execute(input).await;
        self.task_finished(index, task.name(), &result);
        TaskOutcome {
            index,
            name: task.name().to_string(),
            result,
        }
    }

    fn task_started(&self, index: usize, name: &str) {
        self.emit(
            event_types::PATTERN_TASK_STARTED,
            json!({ "task_index": index, "task_name": name }),
        );
    }

    fn task_finished(&self, index: usize, name: &str, result: &Result<Value, TaskError>) {
        match result {
            Ok(_) => self.emit(
                event_types::PATTERN_TASK_COMPLETED,
                json!({ "task_index": index, "task_name": name }),
            ),
            Err(e) => self.emit(
                event_types::PATTERN_TASK_FAILED,
                json!({ "task_index": index, "task_name": name, "error": e.message }),
            ),
        }
    }

    fn result(&self, results: Vec<TaskOutcome>) -> PatternResult {
        PatternResult {
            execution_id: self.id,
            pattern: self.pattern,
            success: results.iter().all(TaskOutcome::is_ok),
            results,
            output: None,
            branch: None,
            winner: None,
            attempts: None,
            breaker_state: None,
            duration: self.started.elapsed(),
        }
    }

    fn complete(self, result: PatternResult) -> Result<PatternResult, PatternError> {
        self.emit(
            event_types::PATTERN_COMPLETED,
            json!({
                "duration_ms": result.duration.as_millis() as u64,
                "success": result.success,
                "task_count": result.results.len(),
            }),
        );
        Ok(result)
    }

    fn fail(self, error: PatternError) -> Result<PatternResult, PatternError> {
        debug!(pattern = %self.pattern, execution_id = %self.id, error = %error, "Pattern failed");
        self.emit(
            event_types::PATTERN_FAILED,
            json!({
                "duration_ms": self.started.elapsed().as_millis() as u64,
                "error": error.to_string(),
            }),
        );
        Err(error)
    }
}

impl Drop for Execution<'_> {
    fn drop(&mut self) {
        let counters = &self.patterns.counters;
        counters.active.fetch_sub(1, Ordering::SeqCst);
        counters.finished.fetch_add(1, Ordering::SeqCst);
    }
}

fn task_error(outcome: &TaskOutcome) -> Option<PatternError> {
    outcome.result.as_ref().err().map(|source| PatternError::Task {
        task: outcome.name.clone(),
        source: source.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantheon_core::MemorySink;

    #[test]
    fn test_pattern_kind_names() {
        for kind in [
            PatternKind::Sequential,
            PatternKind::FanOut,
            PatternKind::CircuitBreaker,
            PatternKind::Saga,
        ] {
            assert_eq!(kind.as_str().parse::<PatternKind>().unwrap(), kind);
        }
        assert!(matches!(
            "teleport".parse::<PatternKind>(),
            Err(PatternError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_chunk_distributor() {
        let chunks = chunk_distributor(&json!([1, 2, 3, 4, 5]), 2);
        assert_eq!(chunks, vec![json!([1, 2, 3]), json!([4, 5])]);

        let fewer = chunk_distributor(&json!([1]), 3);
        assert_eq!(fewer, vec![json!([1])]);

        assert_eq!(chunk_distributor(&json!({"k": 1}), 2), vec![json!({"k": 1})]);
    }

    #[tokio::test]
    async fn test_statistics_track_executions() {
        let sink = MemorySink::new();
        let patterns = ExecutionPatterns::with_events(Arc::new(sink.clone()));
        let tasks = vec![TaskSpec::new(task_fn("noop", |_| async { Ok(json!(1)) }))];

        patterns.sequential(&tasks, json!({})).await.unwrap();
        patterns.sequential(&tasks, json!({})).await.unwrap();

        let stats = patterns.statistics();
        assert_eq!(stats.active_executions, 0);
        assert_eq!(stats.finished_executions, 2);
        assert_eq!(sink.count(event_types::PATTERN_STARTED), 2);
        assert_eq!(sink.count(event_types::PATTERN_COMPLETED), 2);
    }
}
