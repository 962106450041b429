//! Saga: ordered steps with best-effort compensation
//!
//! Compensation is not transactional. When a step fails, every completed step
//! that declares a compensation is undone, most recent first; a compensation
//! that fails is reported and the unwind moves on to the next one. The error
//! surfaced to the caller is always the step failure that started the unwind.

use super::task::{merge_context, with_keys};
use super::{ExecutionPatterns, PatternError, PatternKind, PatternResult, SharedTask};
use pantheon_core::{event_types, Event, SharedSink};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tracing::{error, info};
use uuid::Uuid;

/// One forward step and its optional undo
#[derive(Clone)]
pub struct SagaStep {
    pub name: String,
    pub transaction: SharedTask,
    pub compensation: Option<SharedTask>,
    /// Merge an object result into the context of later steps
    pub update_context: bool,
}

impl fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("transaction", &self.transaction.name())
            .field("compensation", &self.compensation.as_ref().map(|c| c.name().to_string()))
            .field("update_context", &self.update_context)
            .finish()
    }
}

impl SagaStep {
    pub fn new(name: impl Into<String>, transaction: SharedTask) -> Self {
        Self {
            name: name.into(),
            transaction,
            compensation: None,
            update_context: false,
        }
    }

    pub fn with_compensation(mut self, compensation: SharedTask) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn update_context(mut self) -> Self {
        self.update_context = true;
        self
    }
}

/// A step that finished its forward action
#[derive(Clone)]
pub struct CompletedStep {
    pub name: String,
    pub result: Value,
    pub compensation: Option<SharedTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step: String,
    pub error: String,
}

/// What an unwind managed to undo
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompensationReport {
    /// Compensated steps, in the order they were undone
    pub compensated: Vec<String>,
    /// Completed steps without a compensation
    pub skipped: Vec<String>,
    pub failed: Vec<CompensationFailure>,
}

impl CompensationReport {
    /// Completed steps whose effects remain
    pub fn not_compensated(&self) -> Vec<String> {
        self.skipped
            .iter()
            .cloned()
            .chain(self.failed.iter().map(|f| f.step.clone()))
            .collect()
    }

    /// True when no compensation failed
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Compensate `completed` in reverse order.
///
/// Each compensation sees the context plus `original_result` and
/// `failure_reason`. Failures are logged and recorded, never raised.
pub async fn unwind(
    completed: &[CompletedStep],
    context: &Value,
    reason: &str,
    events: &SharedSink,
    execution_id: Uuid,
) -> CompensationReport {
    let mut report = CompensationReport::default();

    for step in completed.iter().rev() {
        let Some(compensation) = &step.compensation else {
            report.skipped.push(step.name.clone());
            continue;
        };

        events.emit(Event::new(
            event_types::COMPENSATION_STARTED,
            json!({ "execution_id": execution_id, "step": step.name, "reason": reason }),
        ));

        let input = with_keys(
            context,
            [
                ("original_result", step.result.clone()),
                ("failure_reason", Value::String(reason.to_string())),
            ],
        );

        match compensation.execute(input).await {
            Ok(_) => {
                info!(execution_id = %execution_id, step = %step.name, "Compensation completed");
                events.emit(Event::new(
                    event_types::COMPENSATION_COMPLETED,
                    json!({ "execution_id": execution_id, "step": step.name }),
                ));
                report.compensated.push(step.name.clone());
            }
            Err(e) => {
                error!(
                    execution_id = %execution_id,
                    step = %step.name,
                    error = %e,
                    "Compensation failed"
                );
                events.emit(Event::new(
                    event_types::COMPENSATION_FAILED,
                    json!({ "execution_id": execution_id, "step": step.name, "error": e.message }),
                ));
                report.failed.push(CompensationFailure {
                    step: step.name.clone(),
                    error: e.message,
                });
            }
        }
    }

    report
}

impl ExecutionPatterns {
    /// Run steps in order; on failure compensate the completed ones and
    /// return the original step error with the compensation report.
    pub async fn saga(
        &self,
        steps: &[SagaStep],
        context: Value,
    ) -> Result<PatternResult, PatternError> {
        let execution = self.begin(PatternKind::Saga, json!({ "step_count": steps.len() }));
        let mut context = context;
        let mut completed: Vec<CompletedStep> = Vec::with_capacity(steps.len());
        let mut results = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            let outcome = execution
                .run_task(index, &step.transaction, context.clone())
                .await;

            match &outcome.result {
                Ok(value) => {
                    if step.update_context {
                        merge_context(&mut context, value);
                    }
                    completed.push(CompletedStep {
                        name: step.name.clone(),
                        result: value.clone(),
                        compensation: step.compensation.clone(),
                    });
                }
                Err(source) => {
                    let report = unwind(
                        &completed,
                        &context,
                        &source.message,
                        execution.events(),
                        execution.id,
                    )
                    .await;

                    return execution.fail(PatternError::SagaAborted {
                        step: step.name.clone(),
                        source: source.clone(),
                        report,
                    });
                }
            }
            results.push(outcome);
        }

        let result = execution.result(results);
        execution.complete(result)
    }
}
