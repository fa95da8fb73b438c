//! Scheduled agent orchestration for the firm's marketing automation.
//!
//! Each agent fires on a cron schedule. A fire builds a task, the task travels
//! through a leased per-category queue, and a bounded worker pool hands it to
//! the collaborator bound to the agent's capability. Failures retry with
//! backoff and end in a dead-letter list; metrics and health snapshots are
//! published to an observability sink.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Lifecycle state machine and administrative surface.
//! - [`AgentRegistry`]: Agent configurations and enabled flags.
//! - [`ScheduleTrigger`]: Cron-driven trigger loop with idempotent cancellation.
//! - [`TaskFactory`]: Builds tasks, pulling context from providers under a timeout.
//! - [`TaskQueue`]: Leased priority queue with retry, backoff and dead-lettering.
//! - [`ExecutionEngine`]: Per-category worker pools with per-agent concurrency slots.
//! - [`MetricsRecorder`]: Per-agent counters, moving-average duration and rates.
//! - [`HealthMonitor`]: Periodic health snapshots with bounded retention.

/// Wall-clock abstraction for schedules and deadlines.
pub mod clock;
/// TOML configuration and validation.
pub mod config;
/// Collaborator bindings, worker pools and task execution.
pub mod engine;
/// Task construction from agent config and context providers.
pub mod factory;
/// Per-agent execution metrics.
pub mod metrics;
/// Periodic health sweep.
pub mod monitor;
/// Lifecycle state machine and administrative surface.
pub mod orchestrator;
/// Built-in agent roster.
pub mod profiles;
/// Leased per-category task queues.
pub mod queue;
/// Agent registry.
pub mod registry;
/// Cron parsing and schedule triggers.
pub mod scheduler;
/// Observability sinks.
pub mod sink;
/// Shared domain types (AgentConfig, Task, AgentMetrics, HealthSnapshot, etc.).
pub mod types;

pub use clock::{Clock, SharedClock, SystemClock, VirtualClock};
pub use config::{CategoryConfig, CollaboratorConfig, OrchestratorConfig};
pub use engine::{
    AgentSlots, CapabilityBindings, Collaborator, EngineSettings, ExecutionEngine, ResultHandler,
    RunningPools,
};
pub use factory::{ContextProvider, StaticContextProvider, TaskFactory};
pub use metrics::MetricsRecorder;
pub use monitor::HealthMonitor;
pub use orchestrator::{AgentStatus, Orchestrator, OrchestratorBuilder, OrchestratorState};
pub use profiles::default_agents;
pub use queue::{CompletionLedger, NackOutcome, QueueStats, RetryPolicy, TaskQueue};
pub use registry::AgentRegistry;
pub use scheduler::{CronSchedule, ScheduleTrigger, TriggerHandle, TriggerSet};
pub use sink::{FanoutSink, JsonlSink, ObservabilitySink, OrchestratorEvent, TracingSink};
pub use types::{
    AgentConfig, AgentHealth, AgentMetrics, Capability, DeadLetter, ExecutionParams,
    HandlerOutcome, HealthSnapshot, ProcessSample, QueueHealth, Task, TaskStatus,
};
