//! Core types shared by the Pantheon resilience and workflow crates.
//!
//! - [`TaskError`]: the single error shape reported by opaque units of work
//! - [`Event`] and [`EventSink`]: structured, fire-and-forget notifications
//! - [`EngineConfig`]: layered configuration (defaults, file, environment)
//! - [`telemetry`]: tracing subscriber setup

pub mod config;
pub mod error;
pub mod events;
pub mod task_error;
pub mod telemetry;

pub use config::{
    BreakerSettings, EngineConfig, RetrySettings, SchedulerConfig, TelemetryConfig,
    ValidationMode,
};
pub use error::{CoreError, Result};
pub use events::{
    event_types, ChannelSink, Event, EventSink, FanoutSink, MemorySink, NoopSink, SharedSink,
};
pub use task_error::TaskError;
