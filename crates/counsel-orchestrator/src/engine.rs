use crate::clock::{Clock, SharedClock};
use crate::metrics::MetricsRecorder;
use crate::queue::{NackOutcome, TaskQueue};
use crate::sink::{ObservabilitySink, OrchestratorEvent};
use crate::types::{AgentConfig, Capability, HandlerOutcome, Task};
use async_trait::async_trait;
use counsel_core::{CounselError, CounselResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lease time kept free after the execution budget, so a finished task is
/// settled before its lease can expire.
pub const LEASE_HEADROOM: Duration = Duration::from_millis(100);

/// External service that performs the work of a task.
///
/// One collaborator is bound per capability. The engine enforces `deadline`
/// itself; implementations may use it to bound their own requests.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Perform the task and return its raw result.
    async fn invoke(&self, task: &Task, deadline: Duration) -> CounselResult<Value>;
}

/// Performs the category-specific side effect for a successful result.
#[async_trait]
pub trait ResultHandler: Send + Sync {
    /// Apply the side effect and report what it produced.
    async fn handle(&self, task: &Task, result: Value) -> CounselResult<HandlerOutcome>;
}

#[derive(Clone)]
struct Binding {
    collaborator: Arc<dyn Collaborator>,
    handler: Arc<dyn ResultHandler>,
}

/// Typed mapping from capability to collaborator and result handler.
#[derive(Clone, Default)]
pub struct CapabilityBindings {
    bindings: HashMap<Capability, Binding>,
}

impl CapabilityBindings {
    /// Empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a collaborator and handler to one capability, replacing any earlier pair.
    pub fn bind(
        mut self,
        capability: Capability,
        collaborator: Arc<dyn Collaborator>,
        handler: Arc<dyn ResultHandler>,
    ) -> Self {
        self.bindings.insert(
            capability,
            Binding {
                collaborator,
                handler,
            },
        );
        self
    }

    /// Bind the same pair to every capability not bound yet.
    pub fn bind_remaining(
        mut self,
        collaborator: Arc<dyn Collaborator>,
        handler: Arc<dyn ResultHandler>,
    ) -> Self {
        for capability in Capability::ALL {
            self.bindings.entry(capability).or_insert_with(|| Binding {
                collaborator: collaborator.clone(),
                handler: handler.clone(),
            });
        }
        self
    }

    /// Whether a pair is bound to `capability`.
    pub fn is_bound(&self, capability: Capability) -> bool {
        self.bindings.contains_key(&capability)
    }

    /// Fail with a configuration error naming the first unbound capability.
    pub fn ensure_bound(&self, capabilities: &[Capability]) -> CounselResult<()> {
        match capabilities.iter().find(|c| !self.is_bound(**c)) {
            Some(missing) => Err(CounselError::Configuration(format!(
                "no collaborator bound for capability '{missing}'"
            ))),
            None => Ok(()),
        }
    }

    fn get(&self, capability: Capability) -> Option<Binding> {
        self.bindings.get(&capability).cloned()
    }
}

struct Slot {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

/// Per-agent execution slots bounding how many of an agent's tasks run at once.
#[derive(Default)]
pub struct AgentSlots {
    slots: RwLock<HashMap<String, Slot>>,
}

impl AgentSlots {
    /// No slots; agents get theirs on registration or first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the slot for an agent. An existing slot keeps its permits.
    pub fn register(&self, agent: &AgentConfig) {
        self.slots
            .write()
            .entry(agent.id.clone())
            .or_insert_with(|| Slot {
                limit: agent.max_concurrency.max(1),
                semaphore: Arc::new(Semaphore::new(agent.max_concurrency.max(1))),
            });
    }

    /// Take a slot without waiting. Unknown agents get a single slot.
    pub fn try_acquire(&self, agent_id: &str) -> Option<OwnedSemaphorePermit> {
        if let Some(slot) = self.slots.read().get(agent_id) {
            return slot.semaphore.clone().try_acquire_owned().ok();
        }
        let semaphore = self
            .slots
            .write()
            .entry(agent_id.to_string())
            .or_insert_with(|| Slot {
                limit: 1,
                semaphore: Arc::new(Semaphore::new(1)),
            })
            .semaphore
            .clone();
        semaphore.try_acquire_owned().ok()
    }

    /// Executions currently holding a slot for this agent.
    pub fn in_flight(&self, agent_id: &str) -> usize {
        self.slots
            .read()
            .get(agent_id)
            .map_or(0, |s| s.limit - s.semaphore.available_permits())
    }
}

/// Tunables shared by every worker.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound on any category's worker count.
    pub global_concurrency_cap: usize,
    /// Budget for tasks that carry no deadline of their own, covering the
    /// collaborator and the result handler together.
    pub execution_timeout: Duration,
    /// Longest an idle worker sleeps before re-checking its queue.
    pub poll_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            global_concurrency_cap: 8,
            execution_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(250),
        }
    }
}

struct EngineInner {
    bindings: CapabilityBindings,
    slots: Arc<AgentSlots>,
    metrics: Arc<MetricsRecorder>,
    sink: Arc<dyn ObservabilitySink>,
    clock: SharedClock,
    settings: EngineSettings,
}

/// Runs queued tasks through their collaborator and result handler.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Engine over the given bindings. Nothing runs until [`start`](Self::start).
    pub fn new(
        bindings: CapabilityBindings,
        slots: Arc<AgentSlots>,
        metrics: Arc<MetricsRecorder>,
        sink: Arc<dyn ObservabilitySink>,
        clock: SharedClock,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                bindings,
                slots,
                metrics,
                sink,
                clock,
                settings,
            }),
        }
    }

    /// Per-agent slots shared with the orchestrator.
    pub fn slots(&self) -> &Arc<AgentSlots> {
        &self.inner.slots
    }

    /// Worker count for a category: its concurrency, capped globally.
    pub fn pool_size(&self, category_concurrency: usize) -> usize {
        category_concurrency
            .min(self.inner.settings.global_concurrency_cap)
            .max(1)
    }

    /// Spawn one worker pool per queue.
    pub fn start(&self, pools: Vec<(Arc<TaskQueue>, usize)>) -> RunningPools {
        let (shutdown, _) = watch::channel(false);
        let mut workers = JoinSet::new();
        let mut total = 0;

        for (queue, concurrency) in pools {
            let size = self.pool_size(concurrency);
            info!(category = %queue.category(), workers = size, "Starting worker pool");
            for worker in 0..size {
                let engine = self.clone();
                let queue = queue.clone();
                let stop = shutdown.subscribe();
                workers.spawn(async move { engine.worker_loop(queue, worker, stop).await });
                total += 1;
            }
        }

        RunningPools {
            shutdown,
            workers,
            total,
        }
    }

    async fn worker_loop(
        &self,
        queue: Arc<TaskQueue>,
        worker: usize,
        mut stop: watch::Receiver<bool>,
    ) {
        let category = queue.category();
        debug!(category = %category, worker, "Worker started");
        loop {
            if *stop.borrow() {
                break;
            }
            let slots = &self.inner.slots;
            let leased = queue.try_dequeue_with(|task| slots.try_acquire(&task.agent_id));
            self.report_expired(&queue);
            match leased {
                Some((task, permit)) => {
                    self.run(&queue, task).await;
                    drop(permit);
                    queue.wake();
                }
                None => {
                    tokio::select! {
                        _ = queue.wait_for_work(self.inner.settings.poll_interval) => {}
                        changed = stop.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!(category = %category, worker, "Worker stopped");
    }

    /// Publish tasks the queue dead-lettered because their deadline passed.
    fn report_expired(&self, queue: &TaskQueue) {
        for letter in queue.take_expired() {
            self.inner.metrics.record_dead_letter(&letter.task.agent_id);
            self.inner.sink.emit(&OrchestratorEvent::DeadLetter(letter));
        }
    }

    /// Execute one leased task and settle it with `ack`, `nack` or, for
    /// errors no retry can fix, an immediate dead letter.
    ///
    /// Never panics: a panic inside the collaborator or handler is caught and
    /// treated as a failed attempt.
    pub async fn run(&self, queue: &TaskQueue, task: Task) {
        let task_id = task.id;
        let agent_id = task.agent_id.clone();
        let category = task.category;
        let attempt = task.retry_count + 1;
        let budget = self.budget_for(queue, &task);
        let started = Instant::now();

        info!(
            task_id = %task_id,
            agent_id = %agent_id,
            category = %category,
            attempt,
            "Executing task"
        );

        let engine = self.clone();
        let pipeline = tokio::spawn(async move { engine.pipeline(&task, budget).await });
        let result = match pipeline.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(CounselError::Collaborator(format!(
                "task execution panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Err(CounselError::Collaborator(format!(
                "task execution cancelled: {e}"
            ))),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(outcome) => {
                if let Err(e) = queue.ack(task_id) {
                    warn!(
                        task_id = %task_id,
                        agent_id = %agent_id,
                        error = %e,
                        "Lease lost before ack, result discarded"
                    );
                    return;
                }
                self.inner.metrics.record_success(&agent_id, duration_ms);
                self.inner.metrics.record_outcome(&agent_id, &outcome);
                self.inner.sink.emit(&OrchestratorEvent::TaskSucceeded {
                    task_id,
                    agent_id,
                    category,
                    duration_ms,
                    outcome,
                });
            }
            Err(e) => {
                let retryable = e.is_retryable();
                let reason = e.to_string();
                self.inner.metrics.record_failure(&agent_id);
                self.inner.sink.emit(&OrchestratorEvent::TaskFailed {
                    task_id,
                    agent_id: agent_id.clone(),
                    category,
                    attempt,
                    error: reason.clone(),
                });
                let settled = if retryable {
                    queue.nack(task_id, reason)
                } else {
                    queue
                        .dead_letter(task_id, reason)
                        .map(NackOutcome::DeadLettered)
                };
                match settled {
                    Ok(NackOutcome::Requeued { retry_count, delay }) => {
                        debug!(
                            task_id = %task_id,
                            retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "Retry scheduled"
                        );
                    }
                    Ok(NackOutcome::DeadLettered(letter)) => {
                        error!(
                            task_id = %task_id,
                            agent_id = %agent_id,
                            attempts = letter.attempts,
                            reason = %letter.reason,
                            retryable,
                            "Task dead-lettered"
                        );
                        self.inner.metrics.record_dead_letter(&agent_id);
                        self.inner.sink.emit(&OrchestratorEvent::DeadLetter(letter));
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "Nack failed, lease already reclaimed");
                    }
                }
            }
        }
    }

    /// Time the collaborator and handler may take together: the task's
    /// remaining deadline, else the default. Always ends [`LEASE_HEADROOM`]
    /// before the lease, so a running task is never redelivered.
    fn budget_for(&self, queue: &TaskQueue, task: &Task) -> Duration {
        let wanted = match task.deadline {
            Some(deadline) => (deadline - self.inner.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => self.inner.settings.execution_timeout,
        };
        wanted.min(queue.lease_timeout().saturating_sub(LEASE_HEADROOM))
    }

    async fn pipeline(&self, task: &Task, budget: Duration) -> CounselResult<HandlerOutcome> {
        let binding = self.inner.bindings.get(task.category).ok_or_else(|| {
            CounselError::Configuration(format!(
                "no collaborator bound for capability '{}'",
                task.category
            ))
        })?;

        let started = Instant::now();
        let raw = tokio::time::timeout(budget, binding.collaborator.invoke(task, budget))
            .await
            .map_err(|_| CounselError::ExecutionTimeout {
                task_id: task.id,
                timeout_ms: budget.as_millis() as u64,
            })??;

        let remaining = budget.saturating_sub(started.elapsed());
        tokio::time::timeout(remaining, binding.handler.handle(task, raw))
            .await
            .map_err(|_| {
                CounselError::ResultHandler(format!(
                    "handler for task {} ran past the {}ms execution budget",
                    task.id,
                    budget.as_millis()
                ))
            })?
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to the spawned worker pools.
pub struct RunningPools {
    shutdown: watch::Sender<bool>,
    workers: JoinSet<()>,
    total: usize,
}

impl RunningPools {
    /// Workers spawned across all pools.
    pub fn worker_count(&self) -> usize {
        self.total
    }

    /// Stop pulling new tasks and wait for in-flight ones, at most `grace`.
    ///
    /// Returns `false` when workers had to be aborted.
    pub async fn drain(mut self, grace: Duration) -> bool {
        let _ = self.shutdown.send(true);
        let workers = &mut self.workers;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Worker exited abnormally");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed, aborting workers"
            );
            self.workers.abort_all();
        }
        drained
    }
}
