use crate::engine::{EngineSettings, LEASE_HEADROOM};
use crate::profiles::default_agents;
use crate::queue::RetryPolicy;
use crate::scheduler::CronSchedule;
use crate::types::{AgentConfig, Capability};
use counsel_core::{CounselError, CounselResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Orchestrator configuration, usually loaded from `counsel.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Where dead letters and health snapshots are persisted.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Upper bound on any category's worker pool.
    #[serde(default = "default_global_cap")]
    pub global_concurrency_cap: usize,
    /// Execution budget for tasks without a deadline of their own.
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// How long each context provider may take.
    #[serde(default = "default_context_timeout_ms")]
    pub context_timeout_ms: u64,
    /// Unacked tasks are redelivered after this.
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
    /// Longest an idle worker sleeps between queue checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long `stop` waits for in-flight tasks.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Health monitor period.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    /// Health snapshots kept in memory.
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention: usize,
    /// Weight of the newest sample in the duration average.
    #[serde(default = "default_ema_weight")]
    pub metrics_ema_weight: f64,
    /// Per-category pool size and retry policy.
    #[serde(default)]
    pub categories: BTreeMap<Capability, CategoryConfig>,
    /// Per-capability remote collaborator.
    #[serde(default)]
    pub collaborators: BTreeMap<Capability, CollaboratorConfig>,
    /// Static values stamped into every task's context.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Empty means the built-in roster.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Worker pool size and retry policy of one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Workers for this category, capped globally.
    #[serde(default = "default_category_concurrency")]
    pub concurrency: usize,
    /// Backoff and dead-letter policy.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            concurrency: default_category_concurrency(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Remote service executing tasks of one capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// URL tasks are posted to. `None` means dry run.
    pub endpoint: Option<String>,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_global_cap() -> usize {
    8
}
fn default_execution_timeout_ms() -> u64 {
    120_000
}
fn default_context_timeout_ms() -> u64 {
    2_000
}
fn default_lease_timeout_ms() -> u64 {
    300_000
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_shutdown_grace_ms() -> u64 {
    30_000
}
fn default_health_interval_ms() -> u64 {
    60_000
}
fn default_snapshot_retention() -> usize {
    24
}
fn default_ema_weight() -> f64 {
    0.5
}
fn default_category_concurrency() -> usize {
    1
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            global_concurrency_cap: default_global_cap(),
            execution_timeout_ms: default_execution_timeout_ms(),
            context_timeout_ms: default_context_timeout_ms(),
            lease_timeout_ms: default_lease_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            health_interval_ms: default_health_interval_ms(),
            snapshot_retention: default_snapshot_retention(),
            metrics_ema_weight: default_ema_weight(),
            categories: BTreeMap::new(),
            collaborators: BTreeMap::new(),
            context: Map::new(),
            agents: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse a TOML document. Unknown capabilities are configuration errors.
    pub fn from_toml_str(content: &str) -> CounselResult<Self> {
        toml::from_str(content)
            .map_err(|e| CounselError::Configuration(format!("invalid config: {e}")))
    }

    /// Read and parse a TOML file. Does not validate.
    pub fn load(path: impl AsRef<Path>) -> CounselResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CounselError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Configured agents, or the built-in roster when none are declared.
    pub fn agents(&self) -> Vec<AgentConfig> {
        if self.agents.is_empty() {
            default_agents()
        } else {
            self.agents.clone()
        }
    }

    /// Settings of one category, defaults when absent.
    pub fn category(&self, capability: Capability) -> CategoryConfig {
        self.categories.get(&capability).cloned().unwrap_or_default()
    }

    /// Worker tunables.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            global_concurrency_cap: self.global_concurrency_cap,
            execution_timeout: Duration::from_millis(self.execution_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Per-provider timeout.
    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }

    /// Queue lease.
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    /// Drain grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Monitor period.
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    /// Check every value that would otherwise fail later at start.
    pub fn validate(&self) -> CounselResult<()> {
        if self.global_concurrency_cap == 0 {
            return Err(invalid("global_concurrency_cap must be at least 1"));
        }
        for (name, value) in [
            ("execution_timeout_ms", self.execution_timeout_ms),
            ("context_timeout_ms", self.context_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("health_interval_ms", self.health_interval_ms),
        ] {
            if value == 0 {
                return Err(invalid(&format!("{name} must be greater than 0")));
            }
        }
        let headroom_ms = LEASE_HEADROOM.as_millis() as u64;
        if self.lease_timeout_ms < self.execution_timeout_ms.saturating_add(headroom_ms) {
            return Err(invalid(&format!(
                "lease_timeout_ms must exceed execution_timeout_ms by at least {headroom_ms}ms, \
                 or running tasks get redelivered"
            )));
        }
        if !(self.metrics_ema_weight > 0.0 && self.metrics_ema_weight <= 1.0) {
            return Err(invalid("metrics_ema_weight must be in (0, 1]"));
        }

        for (capability, category) in &self.categories {
            if category.concurrency == 0 {
                return Err(invalid(&format!(
                    "category '{capability}' concurrency must be at least 1"
                )));
            }
            let retry = &category.retry;
            if retry.multiplier < 1.0 {
                return Err(invalid(&format!(
                    "category '{capability}' retry multiplier must be at least 1.0"
                )));
            }
            if retry.base_delay_ms > retry.max_delay_ms {
                return Err(invalid(&format!(
                    "category '{capability}' base_delay_ms exceeds max_delay_ms"
                )));
            }
        }

        let mut seen = HashSet::new();
        for agent in self.agents() {
            if agent.id.trim().is_empty() {
                return Err(invalid("agent id must not be empty"));
            }
            if !seen.insert(agent.id.clone()) {
                return Err(CounselError::DuplicateAgent(agent.id));
            }
            if agent.max_concurrency == 0 {
                return Err(invalid(&format!(
                    "agent '{}' max_concurrency must be at least 1",
                    agent.id
                )));
            }
            CronSchedule::parse(&agent.schedule)?;
        }
        Ok(())
    }
}

fn invalid(message: &str) -> CounselError {
    CounselError::Configuration(message.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.global_concurrency_cap, 8);
        assert_eq!(config.execution_timeout_ms, 120_000);
        assert_eq!(config.snapshot_retention, 24);
        assert_eq!(config.agents().len(), 8);
        assert_eq!(
            config.category(Capability::LeadFollowUp),
            CategoryConfig::default()
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config_parses() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            data_dir = "/var/lib/counsel"
            global_concurrency_cap = 4
            execution_timeout_ms = 30000

            [context]
            firm_name = "Example Injury Law"
            practice_areas = ["car accidents", "workers comp"]

            [categories.lead_follow_up]
            concurrency = 3
            retry = { max_retries = 5, base_delay_ms = 500, multiplier = 3.0, max_delay_ms = 60000 }

            [collaborators.content_creation]
            endpoint = "http://localhost:9000/generate"
            headers = { authorization = "Bearer local" }

            [[agents]]
            id = "leads"
            name = "Leads"
            capability = "lead_follow_up"
            schedule = "*/5 * * * *"
            max_concurrency = 2
            priority = 9
            tools = ["send_email"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/counsel"));
        let leads = config.category(Capability::LeadFollowUp);
        assert_eq!(leads.concurrency, 3);
        assert_eq!(leads.retry.max_retries, 5);
        assert_eq!(leads.retry.multiplier, 3.0);
        assert_eq!(
            config.collaborators[&Capability::ContentCreation]
                .endpoint
                .as_deref(),
            Some("http://localhost:9000/generate")
        );
        assert_eq!(config.context["firm_name"], "Example Injury Law");

        let agents = config.agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].capability, Capability::LeadFollowUp);
        assert!(agents[0].enabled);
        assert_eq!(agents[0].params.model, "gpt-4o");
        assert_eq!(config.engine_settings().global_concurrency_cap, 4);
    }

    #[test]
    fn test_unknown_capability_rejected() {
        let err = OrchestratorConfig::from_toml_str(
            r#"
            [categories.fax_sending]
            concurrency = 1
            "#,
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = OrchestratorConfig::default();
        config.lease_timeout_ms = config.execution_timeout_ms;
        assert!(config.validate().is_err());
        config.lease_timeout_ms = config.execution_timeout_ms + 50;
        assert!(config.validate().is_err());
        config.lease_timeout_ms = config.execution_timeout_ms + 100;
        assert!(config.validate().is_ok());

        let mut config = OrchestratorConfig::default();
        config.metrics_ema_weight = 0.0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.categories.insert(
            Capability::SocialPosting,
            CategoryConfig {
                concurrency: 0,
                ..CategoryConfig::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_and_bad_agents() {
        let agent = AgentConfig::new("a", "A", Capability::SeoOptimization, "0 2 * * *");
        let mut config = OrchestratorConfig {
            agents: vec![agent.clone(), agent.clone()],
            ..OrchestratorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CounselError::DuplicateAgent(_))
        ));

        let mut broken = agent;
        broken.schedule = "61 * * * *".into();
        config.agents = vec![broken];
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_load_missing_file() {
        let err = OrchestratorConfig::load("/nonexistent/counsel.toml").unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
