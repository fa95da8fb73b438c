use crate::clock::{Clock, SharedClock};
use crate::types::{AgentMetrics, HandlerOutcome};
use counsel_core::{CounselError, CounselResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Default weight of a new sample in the duration moving average.
pub const DEFAULT_EMA_WEIGHT: f64 = 0.5;

/// Aggregates per-agent execution counters.
///
/// Each agent has its own lock, so workers for different agents never contend;
/// the outer map is only write-locked when an agent is seen for the first time.
pub struct MetricsRecorder {
    ema_weight: f64,
    clock: SharedClock,
    agents: RwLock<HashMap<String, Arc<Mutex<AgentMetrics>>>>,
}

impl MetricsRecorder {
    /// Recorder with the default moving-average weight.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            ema_weight: DEFAULT_EMA_WEIGHT,
            clock,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Weight given to each new duration sample, clamped to `(0, 1]`.
    pub fn with_ema_weight(mut self, weight: f64) -> Self {
        self.ema_weight = if weight > 0.0 && weight <= 1.0 {
            weight
        } else {
            DEFAULT_EMA_WEIGHT
        };
        self
    }

    /// Create an empty record for an agent. Existing records are kept.
    pub fn register(&self, agent_id: &str) {
        self.cell(agent_id);
    }

    /// Count a successful attempt and fold its duration into the average.
    pub fn record_success(&self, agent_id: &str, duration_ms: u64) {
        let now = self.clock.now();
        let cell = self.cell(agent_id);
        let mut m = cell.lock();
        m.tasks_completed += 1;
        m.tasks_succeeded += 1;
        let sample = duration_ms as f64;
        m.average_duration_ms = if m.tasks_succeeded == 1 {
            sample
        } else {
            m.average_duration_ms * (1.0 - self.ema_weight) + sample * self.ema_weight
        };
        m.last_activity = Some(now);
        recompute_rates(&mut m);
    }

    /// Count a failed attempt.
    pub fn record_failure(&self, agent_id: &str) {
        let now = self.clock.now();
        let cell = self.cell(agent_id);
        let mut m = cell.lock();
        m.tasks_completed += 1;
        m.tasks_failed += 1;
        m.last_activity = Some(now);
        recompute_rates(&mut m);
    }

    /// Count a task given up on.
    pub fn record_dead_letter(&self, agent_id: &str) {
        let cell = self.cell(agent_id);
        cell.lock().dead_lettered += 1;
    }

    /// Add the result handler's domain counters.
    pub fn record_outcome(&self, agent_id: &str, outcome: &HandlerOutcome) {
        let cell = self.cell(agent_id);
        let mut m = cell.lock();
        m.items_produced += outcome.items_produced;
        m.engagement += outcome.engagement;
    }

    /// Copy of one agent's counters. Fails with `NotFound` when nothing was recorded.
    pub fn snapshot(&self, agent_id: &str) -> CounselResult<AgentMetrics> {
        self.agents
            .read()
            .get(agent_id)
            .map(|cell| cell.lock().clone())
            .ok_or_else(|| CounselError::NotFound(format!("metrics for agent '{agent_id}'")))
    }

    /// Every agent's metrics, keyed by id.
    pub fn all(&self) -> BTreeMap<String, AgentMetrics> {
        self.agents
            .read()
            .iter()
            .map(|(id, cell)| (id.clone(), cell.lock().clone()))
            .collect()
    }

    /// Totals across all agents. Rates are recomputed from the summed counts.
    pub fn aggregate(&self) -> AgentMetrics {
        let mut total = AgentMetrics {
            agent_id: "*".to_string(),
            ..AgentMetrics::default()
        };
        for m in self.all().values() {
            total.tasks_completed += m.tasks_completed;
            total.tasks_succeeded += m.tasks_succeeded;
            total.tasks_failed += m.tasks_failed;
            total.dead_lettered += m.dead_lettered;
            total.items_produced += m.items_produced;
            total.engagement += m.engagement;
            total.last_activity = total.last_activity.max(m.last_activity);
        }
        recompute_rates(&mut total);
        total
    }

    /// Serialize the current state as JSON for operator dashboards.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "agents": self.all(),
            "aggregate": self.aggregate(),
        })
    }

    fn cell(&self, agent_id: &str) -> Arc<Mutex<AgentMetrics>> {
        if let Some(cell) = self.agents.read().get(agent_id) {
            return cell.clone();
        }
        self.agents
            .write()
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AgentMetrics {
                    agent_id: agent_id.to_string(),
                    ..AgentMetrics::default()
                }))
            })
            .clone()
    }
}

/// Rounded integer percentage; zero when nothing completed.
fn percent(part: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((part * 100 + total / 2) / total).min(100) as u8
}

fn recompute_rates(m: &mut AgentMetrics) {
    m.success_rate = percent(m.tasks_succeeded, m.tasks_completed);
    m.error_rate = percent(m.tasks_failed, m.tasks_completed);
}
