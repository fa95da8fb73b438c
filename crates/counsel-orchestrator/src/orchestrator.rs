use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::engine::{AgentSlots, CapabilityBindings, ExecutionEngine, RunningPools};
use crate::factory::{ContextProvider, StaticContextProvider, TaskFactory};
use crate::metrics::MetricsRecorder;
use crate::monitor::HealthMonitor;
use crate::queue::{CompletionLedger, QueueStats, TaskQueue};
use crate::registry::AgentRegistry;
use crate::scheduler::{ScheduleTrigger, TriggerSet};
use crate::sink::{ObservabilitySink, TracingSink};
use crate::types::{AgentConfig, AgentMetrics, Capability, DeadLetter, HealthSnapshot};
use chrono::{DateTime, Utc};
use counsel_core::CounselResult;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Not running; `start` is allowed.
    Stopped,
    /// Arming triggers and spawning workers.
    Starting,
    /// Triggers armed, workers pulling.
    Running,
    /// Draining in-flight work.
    Stopping,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrchestratorState::Stopped => "stopped",
            OrchestratorState::Starting => "starting",
            OrchestratorState::Running => "running",
            OrchestratorState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Operator view of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    /// Registered configuration.
    pub config: AgentConfig,
    /// Whether the trigger is armed.
    pub trigger_active: bool,
    /// Tasks currently running.
    pub in_flight: usize,
    /// Next scheduled fire, when the trigger is armed.
    pub next_fire: Option<DateTime<Utc>>,
    /// Counters so far.
    pub metrics: AgentMetrics,
    /// Retained dead letters of this agent.
    pub dead_letters: Vec<DeadLetter>,
}

/// A schedule fire handed from a trigger to the dispatcher.
#[derive(Debug)]
struct TriggerFire {
    agent_id: String,
    fired_at: DateTime<Utc>,
}

/// Builds tasks for trigger fires and enqueues them.
#[derive(Clone)]
struct Dispatcher {
    registry: Arc<AgentRegistry>,
    factory: Arc<TaskFactory>,
    queues: Arc<BTreeMap<Capability, Arc<TaskQueue>>>,
}

impl Dispatcher {
    async fn run(self, mut fires: mpsc::UnboundedReceiver<TriggerFire>) {
        let mut builds = JoinSet::new();
        loop {
            tokio::select! {
                fire = fires.recv() => match fire {
                    Some(fire) => {
                        let dispatcher = self.clone();
                        builds.spawn(async move { dispatcher.dispatch(fire).await });
                    }
                    None => break,
                },
                joined = builds.join_next(), if !builds.is_empty() => {
                    if let Some(Err(e)) = joined {
                        warn!(error = %e, "Task build aborted");
                    }
                }
            }
        }
        while builds.join_next().await.is_some() {}
        debug!("Dispatcher stopped");
    }

    async fn dispatch(&self, fire: TriggerFire) {
        let agent = match self.registry.get(&fire.agent_id) {
            Ok(agent) => agent,
            Err(e) => {
                warn!(agent_id = %fire.agent_id, error = %e, "Fire for unknown agent");
                return;
            }
        };
        if !agent.enabled {
            debug!(agent_id = %agent.id, "Agent disabled, dropping fire");
            return;
        }

        let mut external = Map::new();
        external.insert(
            "fired_at".to_string(),
            Value::String(fire.fired_at.to_rfc3339()),
        );
        let task = self.factory.build(&agent, external).await;

        let Some(queue) = self.queues.get(&agent.capability) else {
            error!(agent_id = %agent.id, category = %agent.capability, "No queue for category");
            return;
        };
        match queue.enqueue(task) {
            Ok(task_id) => info!(
                task_id = %task_id,
                agent_id = %agent.id,
                fired_at = %fire.fired_at,
                "Task scheduled"
            ),
            Err(e) => error!(agent_id = %agent.id, error = %e, "Failed to enqueue task"),
        }
    }
}

/// Everything spawned by `start` and torn down by `stop`.
struct Runtime {
    fires: mpsc::UnboundedSender<TriggerFire>,
    dispatcher: JoinHandle<()>,
    pools: RunningPools,
    monitor: JoinHandle<()>,
    monitor_stop: watch::Sender<bool>,
}

/// Composes registry, triggers, factory, queues, engine, metrics and health.
pub struct Orchestrator {
    config: OrchestratorConfig,
    clock: SharedClock,
    registry: Arc<AgentRegistry>,
    queues: Arc<BTreeMap<Capability, Arc<TaskQueue>>>,
    factory: Arc<TaskFactory>,
    engine: ExecutionEngine,
    metrics: Arc<MetricsRecorder>,
    monitor: Arc<HealthMonitor>,
    sink: Arc<dyn ObservabilitySink>,
    triggers: Arc<Mutex<TriggerSet>>,
    state: RwLock<OrchestratorState>,
    control: tokio::sync::Mutex<Option<Runtime>>,
}

/// Assembles an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    clock: SharedClock,
    bindings: CapabilityBindings,
    providers: Vec<Arc<dyn ContextProvider>>,
    sink: Arc<dyn ObservabilitySink>,
}

impl OrchestratorBuilder {
    /// Replace the wall clock, for tests.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Collaborators and handlers per capability.
    pub fn bindings(mut self, bindings: CapabilityBindings) -> Self {
        self.bindings = bindings;
        self
    }

    /// Add a context provider. Providers are merged in the order added.
    pub fn context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Where events go. Defaults to [`TracingSink`].
    pub fn sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate the configuration, register every agent and wire the components.
    ///
    /// Fails on invalid configuration, duplicate agents or a capability without
    /// a bound collaborator.
    pub fn build(self) -> CounselResult<Orchestrator> {
        let OrchestratorBuilder {
            config,
            clock,
            bindings,
            providers,
            sink,
        } = self;
        config.validate()?;

        let registry = Arc::new(AgentRegistry::new());
        for agent in config.agents() {
            registry.register(agent)?;
        }
        let capabilities = registry.capabilities();
        bindings.ensure_bound(&capabilities)?;

        let ledger = Arc::new(CompletionLedger::default());
        let queues: BTreeMap<Capability, Arc<TaskQueue>> = capabilities
            .iter()
            .map(|&capability| {
                let queue = TaskQueue::new(
                    capability,
                    config.category(capability).retry,
                    clock.clone(),
                    ledger.clone(),
                )
                .with_lease_timeout(config.lease_timeout());
                (capability, Arc::new(queue))
            })
            .collect();
        let queues = Arc::new(queues);

        let metrics =
            Arc::new(MetricsRecorder::new(clock.clone()).with_ema_weight(config.metrics_ema_weight));
        let slots = Arc::new(AgentSlots::new());
        for agent in registry.list() {
            metrics.register(&agent.id);
            slots.register(&agent);
        }

        let mut factory = TaskFactory::new(clock.clone()).with_timeout(config.context_timeout());
        if !config.context.is_empty() {
            factory = factory.with_provider(Arc::new(StaticContextProvider::new(
                "config",
                config.context.clone(),
            )));
        }
        for provider in providers {
            factory = factory.with_provider(provider);
        }
        for &capability in &capabilities {
            factory = factory.with_retry_policy(capability, &config.category(capability).retry);
        }

        let engine = ExecutionEngine::new(
            bindings,
            slots.clone(),
            metrics.clone(),
            sink.clone(),
            clock.clone(),
            config.engine_settings(),
        );

        let triggers = Arc::new(Mutex::new(TriggerSet::new()));
        let monitor = HealthMonitor::new(
            registry.clone(),
            queues.values().cloned().collect(),
            metrics.clone(),
            slots,
            triggers.clone(),
            clock.clone(),
        )
        .with_retention(config.snapshot_retention);

        info!(
            agents = registry.len(),
            categories = queues.len(),
            "Orchestrator assembled"
        );

        Ok(Orchestrator {
            config,
            clock,
            registry,
            queues,
            factory: Arc::new(factory),
            engine,
            metrics,
            monitor: Arc::new(monitor),
            sink,
            triggers,
            state: RwLock::new(OrchestratorState::Stopped),
            control: tokio::sync::Mutex::new(None),
        })
    }
}

impl Orchestrator {
    /// Start assembling an orchestrator from `config`.
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            clock: Arc::new(SystemClock),
            bindings: CapabilityBindings::new(),
            providers: Vec::new(),
            sink: Arc::new(TracingSink),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OrchestratorState {
        *self.state.read()
    }

    fn set_state(&self, state: OrchestratorState) {
        *self.state.write() = state;
        debug!(state = %state, "Orchestrator state changed");
    }

    /// Arm triggers for enabled agents, start worker pools and the health monitor.
    ///
    /// Calling this while running only logs a warning.
    pub async fn start(&self) -> CounselResult<()> {
        let mut control = self.control.lock().await;
        if control.is_some() {
            warn!(state = %self.state(), "Orchestrator already running, start ignored");
            return Ok(());
        }
        self.set_state(OrchestratorState::Starting);

        let (fires, fire_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            registry: self.registry.clone(),
            factory: self.factory.clone(),
            queues: self.queues.clone(),
        };
        let dispatcher = tokio::spawn(dispatcher.run(fire_rx));

        for agent in self.registry.enabled() {
            if let Err(e) = self.arm_trigger(&agent.id, &fires) {
                self.triggers.lock().cancel_all();
                dispatcher.abort();
                self.set_state(OrchestratorState::Stopped);
                return Err(e);
            }
        }

        let pools = self.engine.start(
            self.queues
                .iter()
                .map(|(&capability, queue)| {
                    (queue.clone(), self.config.category(capability).concurrency)
                })
                .collect(),
        );

        let (monitor_stop, monitor_rx) = watch::channel(false);
        let monitor = self.monitor.clone().spawn(
            self.config.health_interval(),
            self.sink.clone(),
            monitor_rx,
        );

        info!(
            triggers = self.triggers.lock().active_count(),
            workers = pools.worker_count(),
            "Orchestrator running"
        );
        *control = Some(Runtime {
            fires,
            dispatcher,
            pools,
            monitor,
            monitor_stop,
        });
        self.set_state(OrchestratorState::Running);
        Ok(())
    }

    /// Cancel triggers, drain workers within the grace period and stop the monitor.
    ///
    /// A no-op when already stopped.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        let Some(runtime) = control.take() else {
            debug!("Orchestrator already stopped");
            return;
        };
        self.set_state(OrchestratorState::Stopping);
        info!("Orchestrator stopping");

        self.triggers.lock().cancel_all();

        let Runtime {
            fires,
            mut dispatcher,
            pools,
            monitor,
            monitor_stop,
        } = runtime;
        drop(fires);

        let grace = self.config.shutdown_grace();
        let deadline = Instant::now() + grace;
        if tokio::time::timeout(grace, &mut dispatcher).await.is_err() {
            warn!("Pending task builds did not finish, aborting dispatcher");
            dispatcher.abort();
        }
        let drained = pools
            .drain(deadline.saturating_duration_since(Instant::now()))
            .await;

        let _ = monitor_stop.send(true);
        if let Err(e) = monitor.await {
            warn!(error = %e, "Health monitor exited abnormally");
        }
        self.sink.flush().await;

        self.set_state(OrchestratorState::Stopped);
        info!(drained, "Orchestrator stopped");
    }

    /// Enable or disable an agent, arming or cancelling its trigger when running.
    pub async fn toggle_agent(&self, agent_id: &str, enabled: bool) -> CounselResult<()> {
        let control = self.control.lock().await;
        self.registry.set_enabled(agent_id, enabled)?;
        let Some(runtime) = control.as_ref() else {
            return Ok(());
        };
        if enabled {
            let active = self.triggers.lock().is_active(agent_id);
            if !active {
                self.arm_trigger(agent_id, &runtime.fires)?;
            }
        } else if self.triggers.lock().cancel(agent_id) {
            info!(agent_id = %agent_id, "Trigger cancelled");
        }
        Ok(())
    }

    /// Metrics of every registered agent, keyed by id.
    pub fn get_metrics(&self) -> BTreeMap<String, AgentMetrics> {
        self.metrics.all()
    }

    /// Operator view of one agent. Fails with `NotFound` for unknown ids.
    pub fn get_agent_status(&self, agent_id: &str) -> CounselResult<AgentStatus> {
        let config = self.registry.get(agent_id)?;
        let trigger_active = self.triggers.lock().is_active(agent_id);
        let next_fire = if trigger_active {
            self.registry
                .schedule(agent_id)?
                .next_after(self.clock.now())
        } else {
            None
        };
        let dead_letters = self
            .queues
            .get(&config.capability)
            .map(|q| {
                q.dead_letters()
                    .into_iter()
                    .filter(|d| d.task.agent_id == agent_id)
                    .collect()
            })
            .unwrap_or_default();

        Ok(AgentStatus {
            trigger_active,
            in_flight: self.engine.slots().in_flight(agent_id),
            next_fire,
            metrics: self.metrics.snapshot(agent_id).unwrap_or_default(),
            dead_letters,
            config,
        })
    }

    /// Most recent health snapshot, if the monitor has ticked.
    pub fn latest_health(&self) -> Option<HealthSnapshot> {
        self.monitor.latest()
    }

    /// Retained health snapshots, oldest first.
    pub fn health_history(&self) -> Vec<HealthSnapshot> {
        self.monitor.history()
    }

    /// Depth counters of every category queue.
    pub fn queue_stats(&self) -> BTreeMap<Capability, QueueStats> {
        self.queues
            .iter()
            .map(|(&capability, queue)| (capability, queue.stats()))
            .collect()
    }

    /// Snapshot of every registered agent.
    pub fn agents(&self) -> Vec<AgentConfig> {
        self.registry.list()
    }

    fn arm_trigger(
        &self,
        agent_id: &str,
        fires: &mpsc::UnboundedSender<TriggerFire>,
    ) -> CounselResult<()> {
        let schedule = self.registry.schedule(agent_id)?;
        let fires = fires.clone();
        let owner = agent_id.to_string();
        let handle = ScheduleTrigger::spawn(
            agent_id,
            schedule,
            self.clock.clone(),
            move |fired_at| {
                let fire = TriggerFire {
                    agent_id: owner.clone(),
                    fired_at,
                };
                if fires.send(fire).is_err() {
                    debug!(agent_id = %owner, "Dispatcher gone, fire dropped");
                }
            },
        );
        self.triggers.lock().insert(agent_id, handle);
        debug!(agent_id = %agent_id, "Trigger armed");
        Ok(())
    }
}
