use crate::clock::{Clock, SharedClock};
use crate::queue::RetryPolicy;
use crate::types::{AgentConfig, Capability, Task};
use async_trait::async_trait;
use counsel_core::{CounselError, CounselResult};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Read-only source of live data stamped into task context.
///
/// Examples: current keyword list, recent lead ids, trending tags.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Name used in logs and in `degraded_providers`.
    fn name(&self) -> &str;

    /// Whether this provider contributes to tasks of `capability`.
    fn serves(&self, _capability: Capability) -> bool {
        true
    }

    /// Entries to merge into the context of a task built for `agent`.
    async fn fetch(&self, agent: &AgentConfig) -> CounselResult<Map<String, Value>>;
}

/// Provider returning a fixed map, for values loaded from configuration.
pub struct StaticContextProvider {
    name: String,
    capabilities: Option<Vec<Capability>>,
    values: Map<String, Value>,
}

impl StaticContextProvider {
    /// Provider returning `values` for every capability.
    pub fn new(name: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            capabilities: None,
            values,
        }
    }

    /// Restrict the provider to the given capabilities.
    pub fn for_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }
}

#[async_trait]
impl ContextProvider for StaticContextProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn serves(&self, capability: Capability) -> bool {
        self.capabilities
            .as_ref()
            .map_or(true, |caps| caps.contains(&capability))
    }

    async fn fetch(&self, _agent: &AgentConfig) -> CounselResult<Map<String, Value>> {
        Ok(self.values.clone())
    }
}

/// Builds concrete tasks for agents at trigger time.
pub struct TaskFactory {
    providers: Vec<Arc<dyn ContextProvider>>,
    timeout: Duration,
    clock: SharedClock,
    retry_limits: HashMap<Capability, u32>,
}

impl TaskFactory {
    /// Factory without providers and a 2 second provider timeout.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            providers: Vec::new(),
            timeout: Duration::from_secs(2),
            clock,
            retry_limits: HashMap::new(),
        }
    }

    /// Upper bound on how long any provider may take.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a provider. Results are merged in the order added.
    pub fn with_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Stamp tasks of `capability` with the policy's retry budget.
    pub fn with_retry_policy(mut self, capability: Capability, policy: &RetryPolicy) -> Self {
        self.retry_limits.insert(capability, policy.max_retries);
        self
    }

    /// Build a task for `agent`.
    ///
    /// Never fails: a provider that errors or exceeds the timeout is skipped
    /// and the task is marked as carrying degraded context.
    pub async fn build(&self, agent: &AgentConfig, external: Map<String, Value>) -> Task {
        let now = self.clock.now();
        let capability = agent.capability;
        let max_retries = self
            .retry_limits
            .get(&capability)
            .copied()
            .unwrap_or_else(|| RetryPolicy::default().max_retries);

        let mut task = Task::new(agent.id.clone(), capability, task_title(agent))
            .with_description(format!(
                "Scheduled {capability} run for agent '{}'",
                agent.name
            ))
            .with_priority(agent.priority)
            .with_max_retries(max_retries);
        task.created_at = now;
        if let Some(ms) = agent.task_deadline_ms {
            task.deadline = Some(now + chrono::Duration::milliseconds(ms as i64));
        }

        task.context = external;
        task.context.insert("agent_id".into(), Value::String(agent.id.clone()));
        task.context.insert("agent_name".into(), Value::String(agent.name.clone()));
        task.context
            .insert("capability".into(), Value::String(capability.to_string()));
        task.context.insert(
            "params".into(),
            serde_json::to_value(&agent.params).unwrap_or(Value::Null),
        );
        task.context.insert(
            "tools".into(),
            Value::Array(agent.tools.iter().cloned().map(Value::String).collect()),
        );
        task.context.insert("memory".into(), Value::Bool(agent.memory));
        task.context.insert("learning".into(), Value::Bool(agent.learning));

        let (gathered, failed) = self.gather(agent).await;
        for (key, value) in gathered {
            task.context.insert(key, value);
        }
        if !failed.is_empty() {
            task.degraded_context = true;
            task.context.insert(
                "degraded_providers".into(),
                Value::Array(failed.into_iter().map(Value::String).collect()),
            );
        }

        debug!(
            task_id = %task.id,
            agent_id = %agent.id,
            degraded = task.degraded_context,
            "Task built"
        );
        task
    }

    /// Query every relevant provider concurrently, each under the timeout.
    async fn gather(&self, agent: &AgentConfig) -> (Map<String, Value>, Vec<String>) {
        let mut set = JoinSet::new();
        for (index, provider) in self.providers.iter().enumerate() {
            if !provider.serves(agent.capability) {
                continue;
            }
            let provider = provider.clone();
            let agent = agent.clone();
            let timeout = self.timeout;
            set.spawn(async move {
                let name = provider.name().to_string();
                let result = match tokio::time::timeout(timeout, provider.fetch(&agent)).await {
                    Ok(result) => result,
                    Err(_) => Err(CounselError::ContextUnavailable(format!(
                        "provider '{name}' timed out after {}ms",
                        timeout.as_millis()
                    ))),
                };
                (index, name, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => warn!(agent_id = %agent.id, error = %e, "Context provider panicked"),
            }
        }
        // Later providers win on key collisions, independent of completion order.
        results.sort_by_key(|(index, _, _)| *index);

        let mut merged = Map::new();
        let mut failed = Vec::new();
        for (_, name, result) in results {
            match result {
                Ok(values) => merged.extend(values),
                Err(e) => {
                    warn!(
                        agent_id = %agent.id,
                        provider = %name,
                        error = %e,
                        "Context unavailable, building task with degraded context"
                    );
                    failed.push(name);
                }
            }
        }
        (merged, failed)
    }
}

fn task_title(agent: &AgentConfig) -> String {
    let verb = match agent.capability {
        Capability::ContentCreation => "Draft content",
        Capability::SocialPosting => "Publish social update",
        Capability::ReviewResponse => "Respond to reviews",
        Capability::LeadFollowUp => "Follow up with leads",
        Capability::PerformanceCheck => "Check site performance",
        Capability::LegalUpdate => "Scan legal updates",
        Capability::SeoOptimization => "Run SEO audit",
        Capability::WebsiteUpdate => "Refresh website content",
    };
    format!("{verb} ({})", agent.name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use chrono::Utc;
    use serde_json::json;

    struct SlowProvider;

    #[async_trait]
    impl ContextProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow-crm"
        }

        async fn fetch(&self, _agent: &AgentConfig) -> CounselResult<Map<String, Value>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Map::new())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ContextProvider for FailingProvider {
        fn name(&self) -> &str {
            "broken-analytics"
        }

        async fn fetch(&self, _agent: &AgentConfig) -> CounselResult<Map<String, Value>> {
            Err(CounselError::ContextUnavailable("analytics offline".into()))
        }
    }

    fn keywords() -> Arc<dyn ContextProvider> {
        let mut values = Map::new();
        values.insert("keywords".into(), json!(["car accident lawyer", "injury claim"]));
        Arc::new(StaticContextProvider::new("keywords", values))
    }

    fn agent() -> AgentConfig {
        AgentConfig::new("writer", "Blog Writer", Capability::ContentCreation, "0 9 * * *")
            .with_priority(7)
            .with_tools(vec!["keyword_research".into()])
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_stamps_agent_and_provider_context() {
        let clock = Arc::new(VirtualClock::starting_at(Utc::now()));
        let factory = TaskFactory::new(clock)
            .with_provider(keywords())
            .with_retry_policy(
                Capability::ContentCreation,
                &RetryPolicy {
                    max_retries: 5,
                    ..RetryPolicy::default()
                },
            );

        let mut external = Map::new();
        external.insert("fired_at".into(), json!("2026-03-02T09:00:00Z"));
        let task = factory.build(&agent(), external).await;

        assert_eq!(task.agent_id, "writer");
        assert_eq!(task.category, Capability::ContentCreation);
        assert_eq!(task.priority, 7);
        assert_eq!(task.max_retries, 5);
        assert!(task.title.contains("Blog Writer"));
        assert!(!task.degraded_context);
        assert_eq!(task.context["fired_at"], json!("2026-03-02T09:00:00Z"));
        assert_eq!(task.context["capability"], json!("content_creation"));
        assert_eq!(task.context["tools"], json!(["keyword_research"]));
        assert_eq!(task.context["keywords"][0], json!("car accident lawyer"));
        assert!(task.deadline.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_and_failing_providers_degrade_context() {
        let clock = Arc::new(VirtualClock::starting_at(Utc::now()));
        let factory = TaskFactory::new(clock)
            .with_timeout(Duration::from_millis(200))
            .with_provider(Arc::new(SlowProvider))
            .with_provider(Arc::new(FailingProvider))
            .with_provider(keywords());

        let started = tokio::time::Instant::now();
        let task = factory.build(&agent(), Map::new()).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(task.degraded_context);
        assert!(task.context.contains_key("keywords"));
        let degraded = task.context["degraded_providers"].as_array().unwrap();
        assert_eq!(degraded.len(), 2);
        assert!(degraded.contains(&json!("slow-crm")));
        assert!(degraded.contains(&json!("broken-analytics")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_capability_filter() {
        let clock = Arc::new(VirtualClock::starting_at(Utc::now()));
        let mut values = Map::new();
        values.insert("lead_ids".into(), json!(["L-1"]));
        let leads = StaticContextProvider::new("leads", values)
            .for_capabilities(vec![Capability::LeadFollowUp]);
        let factory = TaskFactory::new(clock).with_provider(Arc::new(leads));

        let task = factory.build(&agent(), Map::new()).await;
        assert!(!task.context.contains_key("lead_ids"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_from_agent_config() {
        let origin = Utc::now();
        let clock = Arc::new(VirtualClock::starting_at(origin));
        let factory = TaskFactory::new(clock);
        let task = factory
            .build(&agent().with_task_deadline_ms(60_000), Map::new())
            .await;
        assert_eq!(task.deadline, Some(origin + chrono::Duration::seconds(60)));
        assert_eq!(task.max_retries, RetryPolicy::default().max_retries);
    }
}
