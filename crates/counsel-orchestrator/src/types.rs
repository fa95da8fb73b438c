use chrono::{DateTime, Utc};
use counsel_core::CounselError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use uuid::Uuid;

/// Category of work an agent performs.
///
/// The capability selects the collaborator and result handler that apply to
/// the agent's tasks, and names the queue those tasks travel through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Blog posts, practice-area pages, FAQ drafts.
    ContentCreation,
    /// Posting to social accounts and business profiles.
    SocialPosting,
    /// Replying to client reviews.
    ReviewResponse,
    /// Follow-up messages for captured leads.
    LeadFollowUp,
    /// Traffic and conversion reporting.
    PerformanceCheck,
    /// Tracking statute and case-law changes.
    LegalUpdate,
    /// Keyword and metadata audits.
    SeoOptimization,
    /// Site content refreshes.
    WebsiteUpdate,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 8] = [
        Capability::ContentCreation,
        Capability::SocialPosting,
        Capability::ReviewResponse,
        Capability::LeadFollowUp,
        Capability::PerformanceCheck,
        Capability::LegalUpdate,
        Capability::SeoOptimization,
        Capability::WebsiteUpdate,
    ];

    /// Stable snake_case name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ContentCreation => "content_creation",
            Capability::SocialPosting => "social_posting",
            Capability::ReviewResponse => "review_response",
            Capability::LeadFollowUp => "lead_follow_up",
            Capability::PerformanceCheck => "performance_check",
            Capability::LegalUpdate => "legal_update",
            Capability::SeoOptimization => "seo_optimization",
            Capability::WebsiteUpdate => "website_update",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = CounselError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CounselError::Configuration(format!("Unknown capability '{s}'")))
    }
}

/// Model knobs handed to the collaborator untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Output token limit.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Static configuration of one scheduled agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique, stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Category of work; selects queue, collaborator and handler.
    pub capability: Capability,
    /// Five- or six-field cron expression.
    pub schedule: String,
    /// Tasks of this agent allowed to run at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Higher runs first when several tasks are ready.
    #[serde(default)]
    pub priority: i32,
    /// Disabled agents keep their config but never fire.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Passed through to the collaborator.
    #[serde(default)]
    pub params: ExecutionParams,
    /// Tool names the collaborator may use.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Whether the collaborator should keep memory across runs.
    #[serde(default)]
    pub memory: bool,
    /// Whether the collaborator may learn from feedback.
    #[serde(default)]
    pub learning: bool,
    /// Absolute deadline stamped on each task, relative to build time.
    #[serde(default)]
    pub task_deadline_ms: Option<u64>,
}

fn default_max_concurrency() -> usize {
    1
}

fn default_enabled() -> bool {
    true
}

impl AgentConfig {
    /// Config with defaults: one slot, priority 0, enabled.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        capability: Capability,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capability,
            schedule: schedule.into(),
            max_concurrency: default_max_concurrency(),
            priority: 0,
            enabled: default_enabled(),
            params: ExecutionParams::default(),
            tools: Vec::new(),
            memory: false,
            learning: false,
            task_deadline_ms: None,
        }
    }

    /// Set how many tasks may run at once.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the priority stamped on built tasks.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Start enabled or disabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the collaborator params.
    pub fn with_params(mut self, params: ExecutionParams) -> Self {
        self.params = params;
        self
    }

    /// Set the tool list.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Give each built task a deadline `ms` after build time.
    pub fn with_task_deadline_ms(mut self, ms: u64) -> Self {
        self.task_deadline_ms = Some(ms);
        self
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued or waiting out a backoff.
    Pending,
    /// Leased to a worker.
    Running,
    /// Acked after a successful run.
    Completed,
    /// Terminal failure.
    DeadLettered {
        /// Why the task was given up on.
        reason: String,
    },
}

/// One concrete unit of work produced by a trigger fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub id: Uuid,
    /// Agent whose trigger produced the task.
    pub agent_id: String,
    /// Queue the task belongs to.
    pub category: Capability,
    /// Short human-readable title.
    pub title: String,
    /// Longer description for the collaborator.
    pub description: String,
    /// Inherited from the agent.
    pub priority: i32,
    /// Tasks that must be acked before this one is delivered.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Free-form inputs for the collaborator.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Set when one or more context providers failed during build.
    #[serde(default)]
    pub degraded_context: bool,
    /// Past this instant the task is dead-lettered instead of run.
    pub deadline: Option<DateTime<Utc>>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Failed attempts allowed before dead-lettering.
    pub max_retries: u32,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Build time.
    pub created_at: DateTime<Utc>,
    /// Reason of the most recent failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    /// Pending task with three retries and no deadline.
    pub fn new(agent_id: impl Into<String>, category: Capability, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            category,
            title: title.into(),
            description: String::new(),
            priority: 0,
            dependencies: Vec::new(),
            context: Map::new(),
            degraded_context: false,
            deadline: None,
            retry_count: 0,
            max_retries: 3,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the tasks that must complete first.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Add one context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Whether the deadline, if any, lies at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// What a result handler reports back after performing its side effect.
///
/// The counters are opaque to the orchestrator and summed into [`AgentMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    /// Artifacts created, such as posts or emails.
    pub items_produced: u64,
    /// Engagement the side effect generated.
    pub engagement: u64,
    /// Free-text note for logs.
    pub summary: Option<String>,
}

/// Per-agent performance counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Agent these counters belong to.
    pub agent_id: String,
    /// Attempts that finished, successfully or not.
    pub tasks_completed: u64,
    /// Attempts that were acked.
    pub tasks_succeeded: u64,
    /// Attempts that failed.
    pub tasks_failed: u64,
    /// Tasks dead-lettered for any reason.
    pub dead_lettered: u64,
    /// Exponential moving average of successful execution time.
    pub average_duration_ms: f64,
    /// Time of the last finished attempt.
    pub last_activity: Option<DateTime<Utc>>,
    /// Integer percentage of completed tasks that succeeded.
    pub success_rate: u8,
    /// Integer percentage of completed tasks that failed.
    pub error_rate: u8,
    /// Sum of [`HandlerOutcome::items_produced`].
    pub items_produced: u64,
    /// Sum of [`HandlerOutcome::engagement`].
    pub engagement: u64,
}

/// A task that exhausted its retry budget or its deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The task as it was when it failed for good.
    pub task: Task,
    /// Error of the last attempt, or `deadline expired`.
    pub reason: String,
    /// Failed attempts made.
    pub attempts: u32,
    /// When it was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Health of one agent as seen by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Agent id.
    pub agent_id: String,
    /// Agent capability.
    pub capability: Capability,
    /// Whether the agent is enabled.
    pub enabled: bool,
    /// Whether its trigger is armed.
    pub trigger_active: bool,
    /// Tasks of this agent currently running.
    pub in_flight: usize,
    /// Finished attempts.
    pub tasks_completed: u64,
    /// Success percentage.
    pub success_rate: u8,
    /// Failure percentage.
    pub error_rate: u8,
    /// Dead-lettered tasks.
    pub dead_lettered: u64,
}

/// Reachability and depth of one category queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    /// Queue category.
    pub category: Capability,
    /// Whether the queue answered its probe.
    pub reachable: bool,
    /// Ready tasks.
    pub ready: usize,
    /// Tasks in backoff.
    pub delayed: usize,
    /// Leased tasks.
    pub in_flight: usize,
    /// Retained dead letters.
    pub dead_letters: usize,
}

/// Process resource sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSample {
    /// Resident memory.
    pub memory_bytes: u64,
    /// CPU usage since the previous sample.
    pub cpu_percent: f32,
}

/// Point-in-time health record produced on every monitor tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Sample time.
    pub taken_at: DateTime<Utc>,
    /// Seconds since the orchestrator started.
    pub uptime_secs: u64,
    /// One entry per registered agent.
    pub agents: Vec<AgentHealth>,
    /// One entry per category queue.
    pub queues: Vec<QueueHealth>,
    /// Absent when the process sample could not be taken.
    pub process: Option<ProcessSample>,
}

impl HealthSnapshot {
    /// Every queue reachable and nothing dead-lettered.
    pub fn is_healthy(&self) -> bool {
        self.queues
            .iter()
            .all(|q| q.reachable && q.dead_letters == 0)
    }
}
