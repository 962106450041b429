//! Workflow engine with load-time validation and a bounded stage scheduler
//!
//! A definition is validated once by [`WorkflowEngine::load`]: worker
//! references, gates and the dependency graph are all checked before any run
//! can start. Each run is driven by its own scheduler task, which keeps at
//! most `max_parallel_stages` stages in flight and dispatches a stage only
//! once every declared dependency has completed.
//!
//! Pause stops dispatch and lets in-flight stages finish. Cancel is
//! cooperative: in-flight stages are detached and their results discarded.

use crate::dag::StageDag;
use crate::definition::{
    CompensationSpec, OnFailure, StageSpec, WorkflowDefinition, WorkflowFailurePolicy,
};
use crate::gates::{check_criteria, Gate, GateRegistry};
use crate::patterns::{unwind, CompensationReport, CompletedStep, SharedTask, Task};
use crate::run::{
    FailureCause, RunFailure, RunResult, RunState, StageError, StageMetrics, StageOutcome,
    ValidationCounts, WorkflowRun,
};
use crate::worker::{
    SharedWorker, StageTask, ValidationProfile, Validator, WorkerRegistry,
};
use crate::{Result, WorkflowError};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use pantheon_core::{
    event_types, BreakerSettings, EngineConfig, Event, NoopSink, RetrySettings, SchedulerConfig,
    SharedSink, TaskError, ValidationMode,
};
use pantheon_resilience::{CircuitBreakerRegistry, ResilienceError};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Signal from the control operations to a run's scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunControl {
    Run,
    Pause,
    Cancel,
}

struct RunEntry {
    run: Arc<Mutex<WorkflowRun>>,
    control: watch::Sender<RunControl>,
}

struct EngineInner {
    workers: WorkerRegistry,
    validator: Option<Arc<dyn Validator>>,
    events: SharedSink,
    gates: GateRegistry,
    breakers: Option<CircuitBreakerRegistry>,
    scheduler: SchedulerConfig,
    retry_defaults: RetrySettings,
    runs: DashMap<Uuid, RunEntry>,
}

/// Builder for [`WorkflowEngine`]
pub struct WorkflowEngineBuilder {
    workers: WorkerRegistry,
    validator: Option<Arc<dyn Validator>>,
    events: SharedSink,
    gates: GateRegistry,
    breakers: Option<CircuitBreakerRegistry>,
    breaker_settings: Option<BreakerSettings>,
    scheduler: SchedulerConfig,
    retry_defaults: RetrySettings,
}

impl Default for WorkflowEngineBuilder {
    fn default() -> Self {
        Self {
            workers: WorkerRegistry::new(),
            validator: None,
            events: NoopSink::shared(),
            gates: GateRegistry::new(),
            breakers: None,
            breaker_settings: None,
            scheduler: SchedulerConfig::default(),
            retry_defaults: RetrySettings::default(),
        }
    }
}

impl WorkflowEngineBuilder {
    /// Register a worker under `name`
    pub fn worker(mut self, name: impl Into<String>, worker: SharedWorker) -> Self {
        self.workers.register(name, worker);
        self
    }

    pub fn workers(mut self, workers: WorkerRegistry) -> Self {
        self.workers = workers;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn events(mut self, events: SharedSink) -> Self {
        self.events = events;
        self
    }

    /// Register a named gate predicate
    pub fn gate<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.gates.register(name, predicate);
        self
    }

    /// Route worker calls through breakers keyed by worker name
    pub fn breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn retry_defaults(mut self, retry: RetrySettings) -> Self {
        self.retry_defaults = retry;
        self
    }

    /// Take scheduler, retry and breaker defaults from an engine config
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.scheduler = config.scheduler.clone();
        self.retry_defaults = config.retry.clone();
        self.breaker_settings = Some(config.breaker.clone());
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let events = self.events;
        let breakers = self.breakers.or_else(|| {
            self.breaker_settings
                .map(|settings| CircuitBreakerRegistry::with_events(settings, events.clone()))
        });

        WorkflowEngine {
            inner: Arc::new(EngineInner {
                workers: self.workers,
                validator: self.validator,
                events,
                gates: self.gates,
                breakers,
                scheduler: self.scheduler,
                retry_defaults: self.retry_defaults,
                runs: DashMap::new(),
            }),
        }
    }
}

/// A validated definition, ready to run any number of times
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    definition: Arc<WorkflowDefinition>,
    dag: Arc<StageDag>,
    gates: Arc<HashMap<String, Vec<Gate>>>,
    max_parallel: usize,
    total_timeout: Duration,
    validation_mode: ValidationMode,
}

impl LoadedWorkflow {
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn dag(&self) -> &StageDag {
        &self.dag
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn max_parallel_stages(&self) -> usize {
        self.max_parallel
    }

    pub fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    pub fn validation_mode(&self) -> ValidationMode {
        self.validation_mode
    }

    /// Workflow-level policy for a fatal stage error
    fn policy_for(&self, error: &StageError) -> WorkflowFailurePolicy {
        let handling = &self.definition.error_handling;
        match handling.on_validation_failure {
            Some(policy) if error.is_validation() => policy,
            _ => handling.on_stage_failure,
        }
    }
}

/// Handle to a started run
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    join: JoinHandle<Result<RunResult>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> Result<RunResult> {
        self.join
            .await
            .map_err(|e| WorkflowError::Internal(format!("run {} aborted: {}", self.run_id, e)))?
    }
}

/// Workflow engine
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::default()
    }

    pub fn breakers(&self) -> Option<&CircuitBreakerRegistry> {
        self.inner.breakers.as_ref()
    }

    /// Validate a definition and build its dependency graph
    pub fn load(&self, definition: WorkflowDefinition) -> Result<LoadedWorkflow> {
        if definition.name.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "workflow name is empty".to_string(),
            ));
        }

        let mut gates = HashMap::new();
        for (name, stage) in &definition.stages {
            self.check_workers(name, stage)?;

            let parsed = stage
                .gates
                .iter()
                .map(|expression| self.inner.gates.parse(expression))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| WorkflowError::InvalidDefinition(format!("stage {}: {}", name, e)))?;
            gates.insert(name.clone(), parsed);
        }

        let settings = &definition.global_settings;
        let max_parallel = settings
            .max_parallel_stages
            .unwrap_or(self.inner.scheduler.max_parallel_stages);
        if max_parallel == 0 {
            return Err(WorkflowError::InvalidDefinition(
                "max_parallel_stages must be at least 1".to_string(),
            ));
        }
        let total_timeout = settings
            .total_timeout
            .unwrap_or_else(|| self.inner.scheduler.total_timeout());
        let validation_mode = settings
            .validation_mode
            .unwrap_or(self.inner.scheduler.validation_mode);

        let dag = StageDag::new(&definition)?;

        info!(
            workflow = %definition.name,
            version = %definition.version,
            stage_count = dag.len(),
            "Workflow loaded"
        );

        Ok(LoadedWorkflow {
            definition: Arc::new(definition),
            dag: Arc::new(dag),
            gates: Arc::new(gates),
            max_parallel,
            total_timeout,
            validation_mode,
        })
    }

    fn check_workers(&self, name: &str, stage: &StageSpec) -> Result<()> {
        let known = |agent: &str| self.inner.workers.contains(agent);
        let invalid = |reason: String| Err(WorkflowError::InvalidDefinition(reason));

        if stage.agent.trim().is_empty() {
            return invalid(format!("stage {} has no agent", name));
        }
        if !known(stage.agent.as_str()) {
            return invalid(format!("stage {} references unknown agent {}", name, stage.agent));
        }

        match (&stage.on_failure, &stage.fallback_agent) {
            (OnFailure::Fallback, None) => {
                return invalid(format!(
                    "stage {} uses the fallback policy without a fallback_agent",
                    name
                ));
            }
            (_, Some(agent)) if !known(agent.as_str()) => {
                return invalid(format!(
                    "stage {} references unknown fallback agent {}",
                    name, agent
                ));
            }
            _ => {}
        }

        if let Some(compensation) = &stage.compensation {
            if !known(compensation.agent.as_str()) {
                return invalid(format!(
                    "stage {} references unknown compensation agent {}",
                    name, compensation.agent
                ));
            }
        }

        Ok(())
    }

    /// Start a run in the background.
    ///
    /// Parameters are resolved first; a missing required parameter fails here
    /// and no run is created.
    pub fn start(&self, loaded: &LoadedWorkflow, params: Map<String, Value>) -> Result<RunHandle> {
        let params = loaded.definition.resolve_parameters(params)?;

        let mut run = WorkflowRun::new(&loaded.definition, params);
        run.state = RunState::Running;
        run.started_at = Some(Utc::now());
        let run_id = run.id;

        let run = Arc::new(Mutex::new(run));
        let (control, control_rx) = watch::channel(RunControl::Run);
        self.inner.runs.insert(
            run_id,
            RunEntry {
                run: run.clone(),
                control,
            },
        );

        info!(
            workflow = %loaded.name(),
            run_id = %run_id,
            "Workflow execution started"
        );
        self.inner.events.emit(Event::new(
            event_types::WORKFLOW_STARTED,
            json!({
                "run_id": run_id,
                "workflow": loaded.name(),
                "version": loaded.definition.version,
                "stage_count": loaded.dag.len(),
            }),
        ));

        let scheduler = Scheduler {
            engine: self.inner.clone(),
            loaded: loaded.clone(),
            run_id,
            run,
            control: control_rx,
            ready: loaded.dag.roots().into(),
            dispatched: BTreeSet::new(),
            fatal: None,
            accepted: None,
        };
        let join = tokio::spawn(scheduler.drive());

        Ok(RunHandle { run_id, join })
    }

    /// Start a run and wait for it
    pub async fn run(&self, loaded: &LoadedWorkflow, params: Map<String, Value>) -> Result<RunResult> {
        self.start(loaded, params)?.wait().await
    }

    /// Load, start and wait in one call
    pub async fn execute(
        &self,
        definition: WorkflowDefinition,
        params: Map<String, Value>,
    ) -> Result<RunResult> {
        let loaded = self.load(definition)?;
        self.run(&loaded, params).await
    }

    /// Stop dispatching new stages; in-flight stages run to completion
    pub fn pause(&self, run_id: Uuid) -> Result<()> {
        self.transition(run_id, "pause", |state| state == RunState::Running, RunState::Paused)?;
        self.signal(run_id, RunControl::Pause);

        info!(run_id = %run_id, "Workflow paused");
        self.inner.events.emit(Event::new(
            event_types::WORKFLOW_PAUSED,
            json!({ "run_id": run_id }),
        ));
        Ok(())
    }

    pub fn resume(&self, run_id: Uuid) -> Result<()> {
        self.transition(run_id, "resume", |state| state == RunState::Paused, RunState::Running)?;
        self.signal(run_id, RunControl::Run);

        info!(run_id = %run_id, "Workflow resumed");
        self.inner.events.emit(Event::new(
            event_types::WORKFLOW_RESUMED,
            json!({ "run_id": run_id }),
        ));
        Ok(())
    }

    /// Mark the run cancelled; results of in-flight stages are discarded
    pub fn cancel(&self, run_id: Uuid) -> Result<()> {
        self.transition(run_id, "cancel", |state| !state.is_terminal(), RunState::Cancelled)?;
        self.signal(run_id, RunControl::Cancel);

        info!(run_id = %run_id, "Workflow cancel requested");
        Ok(())
    }

    /// Snapshot of a run
    pub fn status(&self, run_id: Uuid) -> Result<WorkflowRun> {
        let entry = self
            .inner
            .runs
            .get(&run_id)
            .ok_or(WorkflowError::RunNotFound(run_id))?;
        let run = entry.run.lock().clone();
        Ok(run)
    }

    /// Ids of every run this engine knows about
    pub fn run_ids(&self) -> Vec<Uuid> {
        self.inner.runs.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop a finished run and return its final snapshot
    pub fn forget(&self, run_id: Uuid) -> Result<WorkflowRun> {
        let state = self.status(run_id)?.state;
        if !state.is_terminal() {
            return Err(WorkflowError::InvalidState {
                run_id,
                state,
                operation: "forget",
            });
        }

        let (_, entry) = self
            .inner
            .runs
            .remove(&run_id)
            .ok_or(WorkflowError::RunNotFound(run_id))?;
        debug!(run_id = %run_id, "Forgot finished run");
        let run = entry.run.lock().clone();
        Ok(run)
    }

    /// Drop every run in a terminal state; returns how many were removed
    pub fn prune_finished(&self) -> usize {
        let mut removed = 0;
        self.inner.runs.retain(|_, entry| {
            let finished = entry.run.lock().state.is_terminal();
            if finished {
                removed += 1;
            }
            !finished
        });
        if removed > 0 {
            info!(removed, "Pruned finished runs");
        }
        removed
    }

    fn transition<F>(
        &self,
        run_id: Uuid,
        operation: &'static str,
        allowed: F,
        to: RunState,
    ) -> Result<()>
    where
        F: Fn(RunState) -> bool,
    {
        let entry = self
            .inner
            .runs
            .get(&run_id)
            .ok_or(WorkflowError::RunNotFound(run_id))?;
        let mut run = entry.run.lock();

        if !allowed(run.state) {
            return Err(WorkflowError::InvalidState {
                run_id,
                state: run.state,
                operation,
            });
        }
        run.state = to;
        Ok(())
    }

    fn signal(&self, run_id: Uuid, control: RunControl) {
        if let Some(entry) = self.inner.runs.get(&run_id) {
            entry.control.send_replace(control);
        }
    }
}

/// Why the scheduling loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// Nothing left to dispatch and nothing in flight
    Drained,
    Cancelled,
    TimedOut,
}

enum Wake {
    Joined(std::result::Result<StageReport, tokio::task::JoinError>),
    /// `false` once every control sender is gone
    Control(bool),
    Deadline,
}

/// What one dispatched stage produced
struct StageReport {
    stage: String,
    result: std::result::Result<Value, StageError>,
    retries: u32,
    worker: String,
    duration: Duration,
    validations: ValidationCounts,
}

/// Drives one run
struct Scheduler {
    engine: Arc<EngineInner>,
    loaded: LoadedWorkflow,
    run_id: Uuid,
    run: Arc<Mutex<WorkflowRun>>,
    control: watch::Receiver<RunControl>,
    ready: VecDeque<String>,
    dispatched: BTreeSet<String>,
    /// First failure that ends the run
    fatal: Option<StageError>,
    /// First failure accepted under the continue policy
    accepted: Option<StageError>,
}

impl Scheduler {
    async fn drive(mut self) -> Result<RunResult> {
        let deadline = tokio::time::sleep_until(Instant::now() + self.loaded.total_timeout);
        tokio::pin!(deadline);

        let mut in_flight: JoinSet<StageReport> = JoinSet::new();
        let mut control_open = true;

        let stop = loop {
            let control = *self.control.borrow_and_update();
            if control == RunControl::Cancel {
                in_flight.detach_all();
                break Stop::Cancelled;
            }

            if control == RunControl::Run && self.fatal.is_none() {
                while in_flight.len() < self.loaded.max_parallel {
                    let Some(stage) = self.ready.pop_front() else {
                        break;
                    };
                    if self.dispatched.insert(stage.clone()) {
                        self.dispatch(&mut in_flight, stage);
                    }
                }
            }

            // Paused runs still drain once no stage is left to dispatch.
            let nothing_to_dispatch = self.fatal.is_some()
                || self.ready.iter().all(|stage| self.dispatched.contains(stage));
            if in_flight.is_empty() && nothing_to_dispatch {
                break Stop::Drained;
            }

            let wake = tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => Wake::Joined(joined),
                changed = self.control.changed(), if control_open => Wake::Control(changed.is_ok()),
                _ = &mut deadline => Wake::Deadline,
            };

            match wake {
                Wake::Joined(Ok(report)) => self.record(report),
                Wake::Joined(Err(e)) => {
                    error!(run_id = %self.run_id, error = %e, "Stage task aborted")
                }
                Wake::Control(open) => control_open = open,
                Wake::Deadline => {
                    in_flight.detach_all();
                    break Stop::TimedOut;
                }
            }
        };

        self.finish(stop).await
    }

    fn dispatch(&mut self, in_flight: &mut JoinSet<StageReport>, stage: String) {
        let Some(spec) = self.loaded.definition.stages.get(&stage).cloned() else {
            return;
        };

        let (context, previous_results) = {
            let run = self.run.lock();
            let previous: BTreeMap<String, Value> = spec
                .depends_on
                .iter()
                .filter_map(|dep| run.stage_results.get(dep).map(|v| (dep.clone(), v.clone())))
                .collect();
            (run.params.clone(), previous)
        };

        debug!(run_id = %self.run_id, stage = %stage, agent = %spec.agent, "Dispatching stage");
        self.engine.events.emit(Event::new(
            event_types::STAGE_STARTED,
            json!({
                "run_id": self.run_id,
                "workflow": self.loaded.name(),
                "stage": stage,
                "agent": spec.agent,
            }),
        ));

        let execution = StageExecution {
            engine: self.engine.clone(),
            run_id: self.run_id,
            workflow: self.loaded.name().to_string(),
            gates: self.loaded.gates.get(&stage).cloned().unwrap_or_default(),
            validation_mode: self.loaded.validation_mode,
            stage,
            spec,
            context,
            previous_results,
        };

        in_flight.spawn(async move {
            let stage = execution.stage.clone();
            let agent = execution.spec.agent.clone();
            let started = Instant::now();

            match AssertUnwindSafe(execution.execute()).catch_unwind().await {
                Ok(report) => report,
                Err(_) => StageReport {
                    result: Err(StageError::Worker {
                        stage: stage.clone(),
                        source: TaskError::new("stage execution panicked"),
                    }),
                    stage,
                    retries: 0,
                    worker: agent,
                    duration: started.elapsed(),
                    validations: ValidationCounts::default(),
                },
            }
        });
    }

    fn record(&mut self, report: StageReport) {
        let StageReport {
            stage,
            result,
            retries,
            worker,
            duration,
            validations,
        } = report;
        let on_failure = self
            .loaded
            .definition
            .stages
            .get(&stage)
            .map(|spec| spec.on_failure)
            .unwrap_or_default();

        let mut run = self.run.lock();
        if run.state == RunState::Cancelled {
            debug!(run_id = %self.run_id, stage = %stage, "Discarding result of cancelled run");
            return;
        }
        run.validations.merge(validations);

        let (outcome, error) = match result {
            Ok(value) => {
                run.mark_completed(&stage, Some(value));
                (StageOutcome::Succeeded, None)
            }
            Err(error) => match on_failure {
                OnFailure::Continue => {
                    run.mark_completed(&stage, Some(error.to_value()));
                    (StageOutcome::Continued, Some(error))
                }
                OnFailure::Skip => {
                    run.mark_completed(&stage, None);
                    (StageOutcome::Skipped, Some(error))
                }
                OnFailure::Fail | OnFailure::Fallback => {
                    run.mark_failed(&stage);
                    (StageOutcome::Failed, Some(error))
                }
            },
        };

        run.stage_metrics.insert(
            stage.clone(),
            StageMetrics {
                duration_ms: duration.as_millis() as u64,
                success: outcome == StageOutcome::Succeeded,
                retries,
                worker: worker.clone(),
                outcome,
                error: error.as_ref().map(ToString::to_string),
            },
        );

        if outcome != StageOutcome::Failed {
            for dependent in self.loaded.dag.dependents(&stage) {
                if !self.dispatched.contains(&dependent)
                    && self.loaded.dag.is_ready(&dependent, &run.completed_stages)
                {
                    self.ready.push_back(dependent);
                }
            }
        }
        let progress = run.progress();
        drop(run);

        let Some(error) = error else {
            info!(
                run_id = %self.run_id,
                stage = %stage,
                duration_ms = duration.as_millis() as u64,
                retries,
                "Stage completed"
            );
            self.engine.events.emit(Event::new(
                event_types::STAGE_COMPLETED,
                json!({
                    "run_id": self.run_id,
                    "workflow": self.loaded.name(),
                    "stage": stage,
                    "worker": worker,
                    "duration_ms": duration.as_millis() as u64,
                    "retries": retries,
                    "progress": progress,
                }),
            ));
            return;
        };

        self.engine.events.emit(Event::new(
            event_types::STAGE_FAILED,
            json!({
                "run_id": self.run_id,
                "workflow": self.loaded.name(),
                "stage": stage,
                "worker": worker,
                "error": error.to_string(),
                "outcome": outcome,
                "duration_ms": duration.as_millis() as u64,
                "retries": retries,
            }),
        ));

        if outcome != StageOutcome::Failed {
            warn!(
                run_id = %self.run_id,
                stage = %stage,
                outcome = ?outcome,
                error = %error,
                "Stage failed, continuing"
            );
            return;
        }

        error!(run_id = %self.run_id, stage = %stage, error = %error, "Stage failed");
        if self.loaded.policy_for(&error) == WorkflowFailurePolicy::Continue {
            if self.accepted.is_none() {
                self.accepted = Some(error);
            }
        } else if self.fatal.is_none() {
            self.fatal = Some(error);
        }
    }

    async fn finish(mut self, stop: Stop) -> Result<RunResult> {
        let cancelled = stop == Stop::Cancelled || self.run.lock().state == RunState::Cancelled;
        if cancelled {
            let snapshot = {
                let mut run = self.run.lock();
                run.state = RunState::Cancelled;
                run.ended_at = Some(Utc::now());
                run.clone()
            };
            info!(run_id = %self.run_id, "Workflow cancelled");
            self.engine.events.emit(Event::new(
                event_types::WORKFLOW_CANCELLED,
                json!({
                    "run_id": self.run_id,
                    "workflow": self.loaded.name(),
                    "completed_stages": snapshot.completed_stages,
                }),
            ));
            return Ok(RunResult {
                run: snapshot,
                failure: None,
            });
        }

        let handling = &self.loaded.definition.error_handling;
        let (stage, cause, policy) = if stop == Stop::TimedOut {
            (
                None,
                FailureCause::Timeout {
                    after: self.loaded.total_timeout,
                },
                handling.on_stage_failure,
            )
        } else if let Some(error) = self.fatal.take().or_else(|| self.accepted.take()) {
            let policy = self.loaded.policy_for(&error);
            (Some(error.stage().to_string()), FailureCause::Stage(error), policy)
        } else {
            let pending: Vec<String> = {
                let run = self.run.lock();
                self.loaded
                    .definition
                    .stages
                    .keys()
                    .filter(|name| !run.completed_stages.contains(*name))
                    .cloned()
                    .collect()
            };
            if pending.is_empty() {
                return Ok(self.complete());
            }
            (None, FailureCause::Stalled { pending }, handling.on_stage_failure)
        };

        let snapshot = {
            let mut run = self.run.lock();
            run.state = RunState::Failed;
            run.ended_at = Some(Utc::now());
            run.error = Some(cause.to_string());
            run.clone()
        };

        let mut failure = RunFailure {
            run_id: self.run_id,
            workflow: self.loaded.name().to_string(),
            stage,
            cause,
            compensation: None,
        };

        match policy {
            WorkflowFailurePolicy::Rollback => {
                failure.compensation = Some(self.rollback(&snapshot, &failure).await);
            }
            WorkflowFailurePolicy::Notify => self.notify(&failure),
            WorkflowFailurePolicy::Abort | WorkflowFailurePolicy::Continue => {}
        }

        error!(
            run_id = %self.run_id,
            workflow = %failure.workflow,
            stage = ?failure.stage,
            policy = ?policy,
            error = %failure.cause,
            "Workflow failed"
        );
        self.engine.events.emit(Event::new(
            event_types::WORKFLOW_FAILED,
            json!({
                "run_id": self.run_id,
                "workflow": failure.workflow,
                "stage": failure.stage,
                "error": failure.cause.to_string(),
                "policy": policy,
                "duration_ms": snapshot.duration().map(|d| d.as_millis() as u64),
                "compensated": failure.compensated(),
                "not_compensated": failure.not_compensated(),
            }),
        ));

        if policy == WorkflowFailurePolicy::Continue {
            Ok(RunResult {
                run: snapshot,
                failure: Some(failure),
            })
        } else {
            Err(failure.into())
        }
    }

    fn complete(&self) -> RunResult {
        let snapshot = {
            let mut run = self.run.lock();
            run.state = RunState::Completed;
            run.ended_at = Some(Utc::now());
            run.clone()
        };
        let duration_ms = snapshot.duration().map(|d| d.as_millis() as u64);

        info!(
            run_id = %self.run_id,
            workflow = %snapshot.workflow_name,
            duration_ms = ?duration_ms,
            "Workflow completed successfully"
        );
        self.engine.events.emit(Event::new(
            event_types::WORKFLOW_COMPLETED,
            json!({
                "run_id": self.run_id,
                "workflow": snapshot.workflow_name,
                "duration_ms": duration_ms,
                "completed_stages": snapshot.completed_stages,
                "validations": snapshot.validations,
            }),
        ));

        RunResult {
            run: snapshot,
            failure: None,
        }
    }

    /// Compensate stages that succeeded, most recently completed first
    async fn rollback(&self, run: &WorkflowRun, failure: &RunFailure) -> CompensationReport {
        let completed: Vec<CompletedStep> = run
            .completion_order
            .iter()
            .filter(|stage| {
                run.stage_metrics
                    .get(*stage)
                    .map_or(false, |m| m.outcome == StageOutcome::Succeeded)
            })
            .map(|stage| CompletedStep {
                name: stage.clone(),
                result: run.stage_results.get(stage).cloned().unwrap_or_default(),
                compensation: self
                    .loaded
                    .definition
                    .stages
                    .get(stage)
                    .and_then(|spec| spec.compensation.as_ref())
                    .and_then(|compensation| self.compensation_task(run, stage, compensation)),
            })
            .collect();

        info!(
            run_id = %self.run_id,
            stages = completed.len(),
            "Rolling back completed stages"
        );

        let report = unwind(
            &completed,
            &Value::Object(run.params.clone()),
            &failure.cause.to_string(),
            &self.engine.events,
            self.run_id,
        )
        .await;

        if !report.is_clean() {
            warn!(
                run_id = %self.run_id,
                failed = report.failed.len(),
                "Rollback left stages uncompensated"
            );
        }
        report
    }

    fn compensation_task(
        &self,
        run: &WorkflowRun,
        stage: &str,
        compensation: &CompensationSpec,
    ) -> Option<SharedTask> {
        let worker = self.engine.workers.get(&compensation.agent)?;
        let task = StageTask {
            task_type: "compensation".to_string(),
            workflow_name: run.workflow_name.clone(),
            run_id: run.id,
            stage: stage.to_string(),
            task: compensation.task.clone(),
            params: Map::new(),
            context: run.params.clone(),
            previous_results: BTreeMap::new(),
            attempt: 1,
        };
        Some(Arc::new(CompensationTask {
            name: format!("{}:{}", stage, compensation.agent),
            worker,
            task,
        }))
    }

    fn notify(&self, failure: &RunFailure) {
        let definition = &self.loaded.definition;
        let mut channels: Vec<String> = definition.error_handling.notification_channels.clone();
        for channel in &definition.global_settings.notification_channels {
            if !channels.contains(channel) {
                channels.push(channel.clone());
            }
        }

        warn!(
            run_id = %self.run_id,
            channels = ?channels,
            "Sending workflow failure notification"
        );
        self.engine.events.emit(Event::new(
            event_types::WORKFLOW_NOTIFICATION,
            json!({
                "run_id": self.run_id,
                "workflow": failure.workflow,
                "stage": failure.stage,
                "error": failure.cause.to_string(),
                "channels": channels,
            }),
        ));
    }
}

/// Runs a stage's compensation on its worker; the unwind input becomes the params
struct CompensationTask {
    name: String,
    worker: SharedWorker,
    task: StageTask,
}

#[async_trait]
impl Task for CompensationTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Value) -> std::result::Result<Value, TaskError> {
        let mut task = self.task.clone();
        if let Value::Object(params) = input {
            task.params = params;
        }
        self.worker.execute(task).await
    }
}

/// One stage, from first attempt to final outcome
struct StageExecution {
    engine: Arc<EngineInner>,
    run_id: Uuid,
    workflow: String,
    stage: String,
    spec: StageSpec,
    gates: Vec<Gate>,
    validation_mode: ValidationMode,
    context: Map<String, Value>,
    previous_results: BTreeMap<String, Value>,
}

impl StageExecution {
    async fn execute(self) -> StageReport {
        let started = Instant::now();
        let mut validations = ValidationCounts::default();

        let primary = self.spec.agent.clone();
        let (result, mut retries) = self.attempt_with_retry(&primary, &mut validations).await;
        let mut worker = primary;

        let result = match (result, &self.spec.fallback_agent) {
            (Err(primary_error), Some(fallback)) if self.spec.on_failure == OnFailure::Fallback => {
                warn!(
                    run_id = %self.run_id,
                    stage = %self.stage,
                    fallback = %fallback,
                    error = %primary_error,
                    "Falling back to alternate agent"
                );
                self.engine.events.emit(Event::new(
                    event_types::STAGE_FALLBACK,
                    json!({
                        "run_id": self.run_id,
                        "stage": self.stage,
                        "from": worker,
                        "to": fallback,
                        "error": primary_error.to_string(),
                    }),
                ));

                let (fallback_result, fallback_retries) =
                    self.attempt_with_retry(fallback, &mut validations).await;
                retries += fallback_retries;
                worker = fallback.clone();

                fallback_result.map_err(|source| StageError::Fallback {
                    stage: self.stage.clone(),
                    fallback_agent: fallback.clone(),
                    primary: Box::new(primary_error),
                    source: Box::new(source),
                })
            }
            (result, _) => result,
        };

        StageReport {
            stage: self.stage,
            result,
            retries,
            worker,
            duration: started.elapsed(),
            validations,
        }
    }

    /// Attempt on `agent`, retrying retryable errors per the stage policy.
    /// Returns the outcome and the number of retries taken.
    async fn attempt_with_retry(
        &self,
        agent: &str,
        validations: &mut ValidationCounts,
    ) -> (std::result::Result<Value, StageError>, u32) {
        let policy = self
            .spec
            .retry_policy
            .as_ref()
            .map(|policy| policy.to_policy(&self.engine.retry_defaults));
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.attempt(agent, attempt, validations).await {
                Ok(value) => return (Ok(value), attempt - 1),
                Err(error) => error,
            };

            if let Some(policy) = &policy {
                let retry = error
                    .retry_error()
                    .is_some_and(|retry_error| policy.should_retry(&retry_error, attempt));
                if retry {
                    let delay = policy.next_delay(attempt);
                    warn!(
                        run_id = %self.run_id,
                        stage = %self.stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Stage attempt failed, retrying"
                    );
                    self.engine.events.emit(Event::new(
                        event_types::STAGE_RETRYING,
                        json!({
                            "run_id": self.run_id,
                            "stage": self.stage,
                            "agent": agent,
                            "attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                            "error": error.to_string(),
                        }),
                    ));
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let exhausted = policy
                .as_ref()
                .is_some_and(|policy| attempt > 1 && attempt > policy.config().max_retries);
            let error = if exhausted {
                StageError::RetryExhausted {
                    stage: self.stage.clone(),
                    attempts: attempt,
                    source: Box::new(error),
                }
            } else {
                error
            };
            return (Err(error), attempt - 1);
        }
    }

    /// One attempt: worker call under the stage timeout (and breaker), then
    /// gates, success criteria and validation.
    async fn attempt(
        &self,
        agent: &str,
        attempt: u32,
        validations: &mut ValidationCounts,
    ) -> std::result::Result<Value, StageError> {
        let worker = self.engine.workers.get(agent).ok_or_else(|| StageError::Worker {
            stage: self.stage.clone(),
            source: TaskError::new(format!("worker not registered: {}", agent)),
        })?;

        let task = StageTask {
            task_type: self.spec.task_type(),
            workflow_name: self.workflow.clone(),
            run_id: self.run_id,
            stage: self.stage.clone(),
            task: self.spec.task.clone(),
            params: self.spec.params.clone(),
            context: self.context.clone(),
            previous_results: self.previous_results.clone(),
            attempt,
        };

        let timeout = self.spec.timeout;
        let call = async move {
            match timeout {
                Some(after) => match tokio::time::timeout(after, worker.execute(task)).await {
                    Ok(result) => result.map_err(ResilienceError::from),
                    Err(_) => Err(ResilienceError::Timeout { after }),
                },
                None => worker.execute(task).await.map_err(ResilienceError::from),
            }
        };

        let output = match &self.engine.breakers {
            Some(breakers) => breakers.get(agent).execute(|| call).await,
            None => call.await,
        };
        let value = output.map_err(|e| StageError::from_resilience(&self.stage, agent, e))?;

        for gate in &self.gates {
            if !self.engine.gates.evaluate(gate, &value) {
                return Err(StageError::Gate {
                    stage: self.stage.clone(),
                    gate: gate.to_string(),
                });
            }
        }

        check_criteria(&self.spec.success_criteria, &value).map_err(|reason| {
            StageError::Criteria {
                stage: self.stage.clone(),
                reason,
            }
        })?;

        self.validate(&value, validations).await?;

        Ok(value)
    }

    async fn validate(
        &self,
        value: &Value,
        validations: &mut ValidationCounts,
    ) -> std::result::Result<(), StageError> {
        let Some(validator) = &self.engine.validator else {
            return Ok(());
        };
        let strict = self.validation_mode == ValidationMode::Strict;
        if !strict && !self.spec.validation_required {
            return Ok(());
        }

        let profile = ValidationProfile {
            workflow: self.workflow.clone(),
            stage: self.stage.clone(),
            task_type: self.spec.task_type(),
            mode: self.validation_mode,
        };
        let issues = match validator.validate(value, &profile).await {
            Ok(report) if report.passed => {
                validations.record(true);
                return Ok(());
            }
            Ok(report) => report.issues,
            Err(e) => vec![format!("validator error: {}", e)],
        };
        validations.record(false);

        if strict {
            return Err(StageError::Validation {
                stage: self.stage.clone(),
                issues,
            });
        }

        warn!(
            run_id = %self.run_id,
            stage = %self.stage,
            issues = ?issues,
            "Advisory validation rejected stage result"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ErrorHandling;
    use crate::worker::worker_fn;
    use serde_json::json;

    fn echo() -> SharedWorker {
        worker_fn(|task: StageTask| async move { Ok(json!({ "stage": task.stage })) })
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::builder().worker("echo", echo()).build()
    }

    #[test]
    fn test_load_rejects_unknown_agent() {
        let definition =
            WorkflowDefinition::new("wf").with_stage("a", StageSpec::new("ghost", "do it"));

        let err = engine().load(definition).unwrap_err();
        assert!(err.to_string().contains("unknown agent ghost"));
    }

    #[test]
    fn test_load_rejects_fallback_without_agent() {
        let definition = WorkflowDefinition::new("wf").with_stage(
            "a",
            StageSpec::new("echo", "do it").on_failure(OnFailure::Fallback),
        );

        let err = engine().load(definition).unwrap_err();
        assert!(err.to_string().contains("without a fallback_agent"));
    }

    #[test]
    fn test_load_rejects_unregistered_gate() {
        let definition = WorkflowDefinition::new("wf")
            .with_stage("a", StageSpec::new("echo", "do it").with_gate("approved"));

        assert!(matches!(
            engine().load(definition),
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_load_rejects_cycles_and_empty_workflows() {
        let cyclic = WorkflowDefinition::new("wf")
            .with_stage("a", StageSpec::new("echo", "a").depends_on(["b"]))
            .with_stage("b", StageSpec::new("echo", "b").depends_on(["a"]));

        assert!(matches!(
            engine().load(cyclic),
            Err(WorkflowError::Dag(crate::dag::DagValidationError::CycleDetected(_)))
        ));
        assert!(matches!(
            engine().load(WorkflowDefinition::new("wf")),
            Err(WorkflowError::Dag(crate::dag::DagValidationError::EmptyWorkflow))
        ));
    }

    #[test]
    fn test_validation_policy_override() {
        let definition = WorkflowDefinition::new("wf")
            .with_stage("a", StageSpec::new("echo", "a"))
            .with_error_handling(
                ErrorHandling::new(WorkflowFailurePolicy::Abort)
                    .with_validation_policy(WorkflowFailurePolicy::Rollback),
            );
        let loaded = engine().load(definition).unwrap();

        let validation = StageError::Validation {
            stage: "a".into(),
            issues: vec![],
        };
        let gate = StageError::Gate {
            stage: "a".into(),
            gate: "no_critical_issues".into(),
        };
        assert_eq!(loaded.policy_for(&validation), WorkflowFailurePolicy::Rollback);
        assert_eq!(loaded.policy_for(&gate), WorkflowFailurePolicy::Abort);
    }

    #[tokio::test]
    async fn test_execute_passes_dependency_results() {
        let seen = Arc::new(Mutex::new(None));
        let recorder = {
            let seen = seen.clone();
            worker_fn(move |task: StageTask| {
                let seen = seen.clone();
                async move {
                    *seen.lock() = Some(task.previous_results.clone());
                    Ok(json!("done"))
                }
            })
        };
        let engine = WorkflowEngine::builder()
            .worker("echo", echo())
            .worker("recorder", recorder)
            .build();
        let definition = WorkflowDefinition::new("wf")
            .with_stage("first", StageSpec::new("echo", "a"))
            .with_stage("second", StageSpec::new("recorder", "b").depends_on(["first"]));

        let result = engine.execute(definition, Map::new()).await.unwrap();

        assert!(result.is_completed());
        let previous = seen.lock().clone().unwrap();
        assert_eq!(previous["first"], json!({"stage": "first"}));
        assert_eq!(engine.status(result.run.id).unwrap().state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_missing_parameter_creates_no_run() {
        let engine = engine();
        let definition = WorkflowDefinition::new("wf")
            .with_parameter(crate::definition::ParameterSpec::required("feature"))
            .with_stage("a", StageSpec::new("echo", "a"));

        let err = engine.execute(definition, Map::new()).await.unwrap_err();

        assert!(matches!(err, WorkflowError::MissingParameter(ref p) if p == "feature"));
        assert!(engine.run_ids().is_empty());
    }

    #[tokio::test]
    async fn test_control_on_unknown_run() {
        let id = Uuid::new_v4();
        assert!(matches!(engine().pause(id), Err(WorkflowError::RunNotFound(_))));
        assert!(matches!(engine().status(id), Err(WorkflowError::RunNotFound(_))));
    }
}
