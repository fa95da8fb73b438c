use crate::scheduler::CronSchedule;
use crate::types::{AgentConfig, Capability};
use counsel_core::{CounselError, CounselResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::info;

struct AgentEntry {
    config: AgentConfig,
    schedule: CronSchedule,
}

/// Holds the configuration of every scheduled agent.
///
/// Read-mostly: configs are fixed at registration, the only mutation is the
/// enabled flag. Callers that couple enabling with trigger changes serialize
/// those through their own lock.
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, AgentEntry>>,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
        }
    }

    /// Validate and add an agent.
    pub fn register(&self, config: AgentConfig) -> CounselResult<()> {
        validate_agent(&config)?;
        let schedule = CronSchedule::parse(&config.schedule)?;

        let mut agents = self.agents.write();
        if agents.contains_key(&config.id) {
            return Err(CounselError::DuplicateAgent(config.id));
        }
        info!(
            agent_id = %config.id,
            capability = %config.capability,
            schedule = %config.schedule,
            enabled = config.enabled,
            "Registered agent"
        );
        agents.insert(config.id.clone(), AgentEntry { config, schedule });
        Ok(())
    }

    /// Copy of one config. Fails with `NotFound` for unknown ids.
    pub fn get(&self, id: &str) -> CounselResult<AgentConfig> {
        self.agents
            .read()
            .get(id)
            .map(|e| e.config.clone())
            .ok_or_else(|| CounselError::NotFound(format!("agent '{id}'")))
    }

    /// Parsed schedule of an agent.
    pub fn schedule(&self, id: &str) -> CounselResult<CronSchedule> {
        self.agents
            .read()
            .get(id)
            .map(|e| e.schedule.clone())
            .ok_or_else(|| CounselError::NotFound(format!("agent '{id}'")))
    }

    /// Flip the enabled flag. Returns the previous value.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> CounselResult<bool> {
        let mut agents = self.agents.write();
        let entry = agents
            .get_mut(id)
            .ok_or_else(|| CounselError::NotFound(format!("agent '{id}'")))?;
        let previous = entry.config.enabled;
        entry.config.enabled = enabled;
        if previous != enabled {
            info!(agent_id = %id, enabled, "Agent toggled");
        }
        Ok(previous)
    }

    /// Snapshot of every config, ordered by id.
    pub fn list(&self) -> Vec<AgentConfig> {
        self.agents.read().values().map(|e| e.config.clone()).collect()
    }

    /// Configs of enabled agents, ordered by id.
    pub fn enabled(&self) -> Vec<AgentConfig> {
        self.agents
            .read()
            .values()
            .filter(|e| e.config.enabled)
            .map(|e| e.config.clone())
            .collect()
    }

    /// Capabilities used by at least one registered agent.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self
            .agents
            .read()
            .values()
            .map(|e| e.config.capability)
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    /// Registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_agent(config: &AgentConfig) -> CounselResult<()> {
    if config.id.trim().is_empty() {
        return Err(CounselError::Configuration(
            "agent id must not be empty".to_string(),
        ));
    }
    if config.max_concurrency == 0 {
        return Err(CounselError::Configuration(format!(
            "agent '{}' must allow at least one concurrent execution",
            config.id
        )));
    }
    Ok(())
}
