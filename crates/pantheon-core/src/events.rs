//! Structured events and the observer interface the engine publishes to.
//!
//! Publishing is fire-and-forget: [`EventSink::emit`] is synchronous and must
//! not block, so a slow collaborator can never stall the scheduler.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Event type names emitted by the engine.
pub mod event_types {
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const WORKFLOW_PAUSED: &str = "workflow.paused";
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";
    pub const WORKFLOW_NOTIFICATION: &str = "workflow.notification";

    pub const STAGE_STARTED: &str = "stage.started";
    pub const STAGE_COMPLETED: &str = "stage.completed";
    pub const STAGE_FAILED: &str = "stage.failed";
    pub const STAGE_RETRYING: &str = "stage.retrying";
    pub const STAGE_FALLBACK: &str = "stage.fallback";

    pub const BREAKER_OPENED: &str = "breaker.opened";
    pub const BREAKER_HALF_OPENED: &str = "breaker.half_opened";
    pub const BREAKER_CLOSED: &str = "breaker.closed";
    pub const BREAKER_STATE_CHANGED: &str = "breaker.state_changed";
    pub const BREAKER_RESET: &str = "breaker.reset";
    pub const BREAKER_SUCCESS: &str = "breaker.success";
    pub const BREAKER_FAILURE: &str = "breaker.failure";
    pub const BREAKER_REJECTED: &str = "breaker.rejected";
    pub const BREAKER_FALLBACK_EXECUTED: &str = "breaker.fallback_executed";
    pub const BREAKER_FALLBACK_FAILED: &str = "breaker.fallback_failed";

    pub const RETRY_ATTEMPT: &str = "retry.attempt";
    pub const RETRY_SUCCEEDED: &str = "retry.succeeded";
    pub const RETRY_ABORTED: &str = "retry.aborted";
    pub const RETRY_EXHAUSTED: &str = "retry.exhausted";

    pub const PATTERN_STARTED: &str = "pattern.started";
    pub const PATTERN_COMPLETED: &str = "pattern.completed";
    pub const PATTERN_FAILED: &str = "pattern.failed";
    pub const PATTERN_TASK_STARTED: &str = "pattern.task_started";
    pub const PATTERN_TASK_COMPLETED: &str = "pattern.task_completed";
    pub const PATTERN_TASK_FAILED: &str = "pattern.task_failed";

    pub const COMPENSATION_STARTED: &str = "saga.compensation_started";
    pub const COMPENSATION_COMPLETED: &str = "saga.compensation_completed";
    pub const COMPENSATION_FAILED: &str = "saga.compensation_failed";
}

/// Represents a domain event in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: Uuid,
    /// Event type (e.g., "stage.completed", "breaker.opened")
    pub event_type: String,
    /// Timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub payload: serde_json::Value,
    /// Metadata for the event
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Create a new event with the given type and payload.
    pub fn new<T: Serialize>(event_type: impl Into<String>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check if the event matches a given type pattern.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return self.event_type.starts_with(prefix);
        }
        self.event_type == pattern
    }

    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Observer that receives engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: Event) {}
}

impl NoopSink {
    pub fn shared() -> SharedSink {
        Arc::new(NoopSink)
    }
}

/// Sink that forwards events to an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Event receiver dropped, discarding event");
        }
    }
}

/// Sink that records events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Recorded events matching a type pattern (see [`Event::matches`]).
    pub fn matching(&self, pattern: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.matches(pattern))
            .cloned()
            .collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.events.lock().iter().filter(|e| e.matches(pattern)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Sink that forwards every event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: Event) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
