use async_trait::async_trait;
use counsel_core::{CounselError, CounselResult};
use counsel_orchestrator::{Collaborator, CollaboratorConfig, HandlerOutcome, ResultHandler, Task};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

/// Posts each task to an HTTP endpoint and returns the JSON reply.
pub struct WebhookCollaborator {
    client: reqwest::Client,
    endpoint: String,
    headers: Vec<(String, String)>,
}

impl WebhookCollaborator {
    /// Collaborator posting to `endpoint` with the configured headers.
    pub fn new(endpoint: impl Into<String>, config: &CollaboratorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

fn payload(task: &Task, deadline: Duration) -> Value {
    json!({
        "task_id": task.id,
        "agent_id": task.agent_id,
        "category": task.category,
        "title": task.title,
        "description": task.description,
        "attempt": task.retry_count + 1,
        "deadline_ms": deadline.as_millis() as u64,
        "degraded_context": task.degraded_context,
        "context": task.context,
    })
}

#[async_trait]
impl Collaborator for WebhookCollaborator {
    async fn invoke(&self, task: &Task, deadline: Duration) -> CounselResult<Value> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(deadline)
            .json(&payload(task, deadline));
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| CounselError::Collaborator(format!("{}: {e}", self.endpoint)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CounselError::Collaborator(format!(
                "{} answered {status}",
                self.endpoint
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| CounselError::Collaborator(format!("{}: {e}", self.endpoint)))?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Logs the task instead of calling out. Used when no endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunCollaborator;

#[async_trait]
impl Collaborator for DryRunCollaborator {
    async fn invoke(&self, task: &Task, deadline: Duration) -> CounselResult<Value> {
        info!(
            task_id = %task.id,
            agent_id = %task.agent_id,
            category = %task.category,
            title = %task.title,
            deadline_ms = deadline.as_millis() as u64,
            "Dry run"
        );
        Ok(json!({ "dry_run": true, "title": task.title }))
    }
}

/// Logs results and lifts `items_produced` / `engagement` counters from them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingResultHandler;

#[async_trait]
impl ResultHandler for LoggingResultHandler {
    async fn handle(&self, task: &Task, result: Value) -> CounselResult<HandlerOutcome> {
        if let Some(error) = result.get("error").and_then(Value::as_str) {
            return Err(CounselError::ResultHandler(error.to_string()));
        }
        let counter = |key: &str| result.get(key).and_then(Value::as_u64).unwrap_or(0);
        let outcome = HandlerOutcome {
            items_produced: counter("items_produced"),
            engagement: counter("engagement"),
            summary: result.get("summary").and_then(Value::as_str).map(str::to_string),
        };
        info!(
            task_id = %task.id,
            agent_id = %task.agent_id,
            items = outcome.items_produced,
            engagement = outcome.engagement,
            "Result handled"
        );
        Ok(outcome)
    }
}
