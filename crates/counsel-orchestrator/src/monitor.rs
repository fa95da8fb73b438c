use crate::clock::{Clock, SharedClock};
use crate::engine::AgentSlots;
use crate::metrics::MetricsRecorder;
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::scheduler::TriggerSet;
use crate::sink::{ObservabilitySink, OrchestratorEvent};
use crate::types::{AgentHealth, HealthSnapshot, ProcessSample, QueueHealth};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Periodic sweep over agents, queues and the process.
///
/// Keeps the most recent snapshots in memory; older ones are discarded.
pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    queues: Vec<Arc<TaskQueue>>,
    metrics: Arc<MetricsRecorder>,
    slots: Arc<AgentSlots>,
    triggers: Arc<Mutex<TriggerSet>>,
    clock: SharedClock,
    started: Instant,
    retention: usize,
    history: Mutex<VecDeque<HealthSnapshot>>,
    system: Mutex<System>,
}

impl HealthMonitor {
    /// Monitor over the given components, sampling this process.
    pub fn new(
        registry: Arc<AgentRegistry>,
        queues: Vec<Arc<TaskQueue>>,
        metrics: Arc<MetricsRecorder>,
        slots: Arc<AgentSlots>,
        triggers: Arc<Mutex<TriggerSet>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            queues,
            metrics,
            slots,
            triggers,
            clock,
            started: Instant::now(),
            retention: 24,
            history: Mutex::new(VecDeque::new()),
            system: Mutex::new(System::new()),
        }
    }

    /// Number of snapshots kept. At least one.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Take one snapshot and add it to the history.
    ///
    /// Failed sub-checks show up as unreachable queues or a missing process
    /// sample; the sweep itself always completes.
    pub fn collect(&self) -> HealthSnapshot {
        let triggers = self.triggers.lock();
        let agents = self
            .registry
            .list()
            .into_iter()
            .map(|agent| {
                let metrics = self.metrics.snapshot(&agent.id).unwrap_or_default();
                AgentHealth {
                    trigger_active: triggers.is_active(&agent.id),
                    in_flight: self.slots.in_flight(&agent.id),
                    tasks_completed: metrics.tasks_completed,
                    success_rate: metrics.success_rate,
                    error_rate: metrics.error_rate,
                    dead_lettered: metrics.dead_lettered,
                    enabled: agent.enabled,
                    capability: agent.capability,
                    agent_id: agent.id,
                }
            })
            .collect();
        drop(triggers);

        let queues = self
            .queues
            .iter()
            .map(|queue| {
                let reachable = match queue.probe() {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(category = %queue.category(), error = %e, "Queue probe failed");
                        false
                    }
                };
                let stats = queue.stats();
                QueueHealth {
                    category: queue.category(),
                    reachable,
                    ready: stats.ready,
                    delayed: stats.delayed,
                    in_flight: stats.in_flight,
                    dead_letters: stats.dead_letters,
                }
            })
            .collect();

        let snapshot = HealthSnapshot {
            taken_at: self.clock.now(),
            uptime_secs: self.started.elapsed().as_secs(),
            agents,
            queues,
            process: self.sample_process(),
        };

        let mut history = self.history.lock();
        history.push_back(snapshot.clone());
        while history.len() > self.retention {
            history.pop_front();
        }
        snapshot
    }

    /// Most recent snapshot, if any was taken.
    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.history.lock().back().cloned()
    }

    /// Retained snapshots, oldest first.
    pub fn history(&self) -> Vec<HealthSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    /// Run the sweep every `interval` until `stop` flips, publishing each snapshot.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        sink: Arc<dyn ObservabilitySink>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = self.collect();
                        debug!(healthy = snapshot.is_healthy(), "Health sweep complete");
                        sink.emit(&OrchestratorEvent::Health(snapshot));
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }

    fn sample_process(&self) -> Option<ProcessSample> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );
        let process = system.process(pid)?;
        Some(ProcessSample {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }
}
