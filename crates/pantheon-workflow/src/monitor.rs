//! Run monitoring
//!
//! [`RunMonitor`] is an [`EventSink`] that folds engine events into
//! per-workflow statistics. Attach it directly or through a `FanoutSink`.

use pantheon_core::{event_types, Event, EventSink};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Coarse failure classification, matched on the error text
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    Validation,
    RateLimit,
    Permission,
    Network,
    Memory,
    Other,
}

impl FailureCategory {
    pub fn categorize(error: &str) -> Self {
        let error = error.to_lowercase();
        let checks = [
            ("timeout", FailureCategory::Timeout),
            ("timed out", FailureCategory::Timeout),
            ("validation", FailureCategory::Validation),
            ("rate_limit", FailureCategory::RateLimit),
            ("rate limit", FailureCategory::RateLimit),
            ("permission", FailureCategory::Permission),
            ("network", FailureCategory::Network),
            ("memory", FailureCategory::Memory),
        ];

        checks
            .iter()
            .find(|(needle, _)| error.contains(needle))
            .map_or(FailureCategory::Other, |(_, category)| *category)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::Validation => "validation",
            FailureCategory::RateLimit => "rate_limit",
            FailureCategory::Permission => "permission",
            FailureCategory::Network => "network",
            FailureCategory::Memory => "memory",
            FailureCategory::Other => "other",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub executions: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

impl StageStats {
    pub fn average_duration_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.executions as f64
        }
    }
}

/// Aggregated numbers for one workflow name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Summed duration of finished runs that reported one
    pub total_duration_ms: u64,
    pub timed_runs: u64,
    pub stages: BTreeMap<String, StageStats>,
    pub failure_reasons: BTreeMap<FailureCategory, u64>,
}

impl WorkflowStats {
    pub fn average_duration_ms(&self) -> f64 {
        if self.timed_runs == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.timed_runs as f64
        }
    }

    /// Completed runs over finished runs
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64
        }
    }

    fn record_duration(&mut self, event: &Event) {
        if let Some(ms) = event.payload.get("duration_ms").and_then(|v| v.as_u64()) {
            self.total_duration_ms += ms;
            self.timed_runs += 1;
        }
    }
}

#[derive(Default)]
struct MonitorState {
    workflows: HashMap<String, WorkflowStats>,
    /// Running run id to workflow name
    active: HashMap<String, String>,
}

/// Event sink aggregating run statistics
#[derive(Clone, Default)]
pub struct RunMonitor {
    state: Arc<Mutex<MonitorState>>,
}

impl RunMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<dyn EventSink> {
        Arc::new(self.clone())
    }

    /// Stats for one workflow
    pub fn stats(&self, workflow: &str) -> Option<WorkflowStats> {
        self.state.lock().workflows.get(workflow).cloned()
    }

    /// Stats for every workflow seen so far
    pub fn all_stats(&self) -> BTreeMap<String, WorkflowStats> {
        self.state
            .lock()
            .workflows
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect()
    }

    /// Number of runs started but not yet finished
    pub fn active_runs(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.workflows.clear();
        state.active.clear();
    }

    fn record(&self, event: &Event) {
        let run_id = event
            .payload
            .get("run_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let mut state = self.state.lock();

        let workflow = match event.payload_str("workflow") {
            Some(name) => name.to_string(),
            None => match run_id.as_ref().and_then(|id| state.active.get(id)) {
                Some(name) => name.clone(),
                None => return,
            },
        };

        match event.event_type.as_str() {
            event_types::WORKFLOW_STARTED => {
                if let Some(id) = run_id {
                    state.active.insert(id, workflow.clone());
                }
                state.workflows.entry(workflow).or_default().started += 1;
            }
            event_types::WORKFLOW_COMPLETED => {
                if let Some(id) = &run_id {
                    state.active.remove(id);
                }
                let stats = state.workflows.entry(workflow).or_default();
                stats.completed += 1;
                stats.record_duration(event);
            }
            event_types::WORKFLOW_FAILED => {
                if let Some(id) = &run_id {
                    state.active.remove(id);
                }
                let stats = state.workflows.entry(workflow).or_default();
                stats.failed += 1;
                stats.record_duration(event);
            }
            event_types::WORKFLOW_CANCELLED => {
                if let Some(id) = &run_id {
                    state.active.remove(id);
                }
                state.workflows.entry(workflow).or_default().cancelled += 1;
            }
            event_types::STAGE_COMPLETED | event_types::STAGE_FAILED => {
                let Some(stage) = event.payload_str("stage") else {
                    return;
                };
                let duration_ms = event
                    .payload
                    .get("duration_ms")
                    .and_then(|v| v.as_u64())
                    .unwrap_or_default();

                let stats = state.workflows.entry(workflow).or_default();
                let stage_stats = stats.stages.entry(stage.to_string()).or_default();
                stage_stats.executions += 1;
                stage_stats.total_duration_ms += duration_ms;

                if event.event_type == event_types::STAGE_FAILED {
                    stage_stats.failures += 1;
                    let category =
                        FailureCategory::categorize(event.payload_str("error").unwrap_or_default());
                    *stats.failure_reasons.entry(category).or_default() += 1;
                }
            }
            _ => {}
        }
    }
}

impl EventSink for RunMonitor {
    fn emit(&self, event: Event) {
        trace!(event_type = %event.event_type, "Monitor received event");
        self.record(&event);
    }
}
