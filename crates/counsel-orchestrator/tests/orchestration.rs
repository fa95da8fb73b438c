//! End-to-end orchestration tests.
//!
//! Runs the full trigger, factory, queue, engine and metrics pipeline on
//! tokio's paused clock, with stub collaborators standing in for the content
//! and delivery services.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use counsel_core::CounselResult;
use counsel_orchestrator::*;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Stub collaborators
// ---------------------------------------------------------------------------

/// Always succeeds after 5ms.
#[derive(Default)]
struct QuickSuccess {
    calls: AtomicUsize,
}

#[async_trait]
impl Collaborator for QuickSuccess {
    async fn invoke(&self, task: &Task, _deadline: Duration) -> CounselResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(serde_json::json!({ "draft": task.title }))
    }
}

/// Never answers in time.
#[derive(Default)]
struct AlwaysTimesOut {
    calls: AtomicUsize,
}

#[async_trait]
impl Collaborator for AlwaysTimesOut {
    async fn invoke(&self, _task: &Task, _deadline: Duration) -> CounselResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        Ok(Value::Null)
    }
}

#[derive(Default)]
struct CountingHandler {
    handled: AtomicUsize,
}

#[async_trait]
impl ResultHandler for CountingHandler {
    async fn handle(&self, _task: &Task, _result: Value) -> CounselResult<HandlerOutcome> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerOutcome {
            items_produced: 1,
            engagement: 0,
            summary: Some("draft saved".into()),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const AGENT: &str = "minute-writer";

fn every_minute_agent() -> AgentConfig {
    AgentConfig::new(AGENT, "Minute Writer", Capability::ContentCreation, "*/1 * * * *")
        .with_max_concurrency(1)
}

fn config(retry: RetryPolicy) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        agents: vec![every_minute_agent()],
        execution_timeout_ms: 1_000,
        health_interval_ms: 60_000,
        shutdown_grace_ms: 5_000,
        ..OrchestratorConfig::default()
    };
    config.categories.insert(
        Capability::ContentCreation,
        CategoryConfig {
            concurrency: 1,
            retry,
        },
    );
    config
}

/// Half a minute past 08:00, so fires land at +30s, +90s and +150s.
fn clock() -> SharedClock {
    Arc::new(VirtualClock::starting_at(
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 30).unwrap(),
    ))
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_three_minutes_of_successful_runs() {
    let collaborator = Arc::new(QuickSuccess::default());
    let handler = Arc::new(CountingHandler::default());
    let orchestrator = Orchestrator::builder(config(RetryPolicy::default()))
        .clock(clock())
        .bindings(CapabilityBindings::new().bind(
            Capability::ContentCreation,
            collaborator.clone(),
            handler.clone(),
        ))
        .build()
        .unwrap();

    orchestrator.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(180)).await;
    orchestrator.stop().await;

    assert_eq!(collaborator.calls.load(Ordering::SeqCst), 3);
    assert_eq!(handler.handled.load(Ordering::SeqCst), 3);

    let metrics = orchestrator.get_metrics()[AGENT].clone();
    assert_eq!(metrics.tasks_completed, 3);
    assert_eq!(metrics.tasks_succeeded, 3);
    assert_eq!(metrics.success_rate, 100);
    assert_eq!(metrics.error_rate, 0);
    assert_eq!(metrics.items_produced, 3);
    assert!(metrics.average_duration_ms >= 5.0 && metrics.average_duration_ms < 7.0);

    let stats = orchestrator.queue_stats()[&Capability::ContentCreation];
    assert_eq!(stats, QueueStats::default());
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_dead_letter_once_per_fire() {
    let dir = tempfile::tempdir().unwrap();
    let collaborator = Arc::new(AlwaysTimesOut::default());
    let handler = Arc::new(CountingHandler::default());
    let retry = RetryPolicy {
        max_retries: 2,
        base_delay_ms: 100,
        multiplier: 2.0,
        max_delay_ms: 1_000,
    };
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(Arc::new(JsonlSink::new(dir.path())));
    let orchestrator = Orchestrator::builder(config(retry))
        .clock(clock())
        .bindings(CapabilityBindings::new().bind(
            Capability::ContentCreation,
            collaborator.clone(),
            handler.clone(),
        ))
        .sink(Arc::new(sink))
        .build()
        .unwrap();

    orchestrator.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(180)).await;
    assert_eq!(orchestrator.state(), OrchestratorState::Running);

    let status = orchestrator.get_agent_status(AGENT).unwrap();
    assert_eq!(status.dead_letters.len(), 3);
    for letter in &status.dead_letters {
        assert_eq!(letter.attempts, 2);
        assert!(letter.reason.contains("timed out"));
    }
    let fired: std::collections::HashSet<_> = status
        .dead_letters
        .iter()
        .map(|d| d.task.context["fired_at"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(fired.len(), 3);
    assert_eq!(status.in_flight, 0);

    orchestrator.stop().await;

    assert_eq!(collaborator.calls.load(Ordering::SeqCst), 6);
    assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
    let metrics = orchestrator.get_metrics()[AGENT].clone();
    assert_eq!(metrics.tasks_completed, 6);
    assert_eq!(metrics.tasks_failed, 6);
    assert_eq!(metrics.dead_lettered, 3);
    assert_eq!(metrics.success_rate, 0);
    assert_eq!(metrics.error_rate, 100);

    let persisted = std::fs::read_to_string(dir.path().join("dead_letters.jsonl")).unwrap();
    assert_eq!(persisted.lines().count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_are_idempotent() {
    let orchestrator = Orchestrator::builder(config(RetryPolicy::default()))
        .clock(clock())
        .bindings(CapabilityBindings::new().bind_remaining(
            Arc::new(QuickSuccess::default()),
            Arc::new(CountingHandler::default()),
        ))
        .build()
        .unwrap();

    orchestrator.stop().await;
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);

    orchestrator.start().await.unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.state(), OrchestratorState::Running);

    orchestrator.stop().await;
    orchestrator.stop().await;
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    assert!(!orchestrator.get_agent_status(AGENT).unwrap().trigger_active);

    // Restart after stop works and re-arms the trigger.
    orchestrator.start().await.unwrap();
    assert!(orchestrator.get_agent_status(AGENT).unwrap().trigger_active);
    orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_toggle_agent_arms_and_cancels_trigger() {
    let collaborator = Arc::new(QuickSuccess::default());
    let orchestrator = Orchestrator::builder(config(RetryPolicy::default()))
        .clock(clock())
        .bindings(CapabilityBindings::new().bind(
            Capability::ContentCreation,
            collaborator.clone(),
            Arc::new(CountingHandler::default()),
        ))
        .build()
        .unwrap();

    orchestrator.start().await.unwrap();
    orchestrator.toggle_agent(AGENT, false).await.unwrap();
    let status = orchestrator.get_agent_status(AGENT).unwrap();
    assert!(!status.config.enabled);
    assert!(!status.trigger_active);

    // Disabled across two fire times: nothing runs.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(collaborator.calls.load(Ordering::SeqCst), 0);

    // Re-enabled at 08:02:30; the next fire is 08:03.
    orchestrator.toggle_agent(AGENT, true).await.unwrap();
    let status = orchestrator.get_agent_status(AGENT).unwrap();
    assert!(status.trigger_active);
    assert_eq!(
        status.next_fire,
        Some(Utc.with_ymd_and_hms(2026, 3, 2, 8, 3, 0).unwrap())
    );
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(collaborator.calls.load(Ordering::SeqCst), 1);

    orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_agent_gets_no_trigger_on_start() {
    let mut cfg = config(RetryPolicy::default());
    cfg.agents = vec![every_minute_agent().with_enabled(false)];
    let orchestrator = Orchestrator::builder(cfg)
        .clock(clock())
        .bindings(CapabilityBindings::new().bind_remaining(
            Arc::new(QuickSuccess::default()),
            Arc::new(CountingHandler::default()),
        ))
        .build()
        .unwrap();

    orchestrator.start().await.unwrap();
    assert!(!orchestrator.get_agent_status(AGENT).unwrap().trigger_active);
    orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_health_snapshots_published() {
    let orchestrator = Orchestrator::builder(config(RetryPolicy::default()))
        .clock(clock())
        .bindings(CapabilityBindings::new().bind_remaining(
            Arc::new(QuickSuccess::default()),
            Arc::new(CountingHandler::default()),
        ))
        .build()
        .unwrap();
    assert!(orchestrator.latest_health().is_none());

    orchestrator.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(125)).await;
    orchestrator.stop().await;

    let history = orchestrator.health_history();
    assert_eq!(history.len(), 3);
    let latest = orchestrator.latest_health().unwrap();
    assert!(latest.is_healthy());
    assert_eq!(latest.agents.len(), 1);
    assert!(latest.agents[0].trigger_active);
    assert_eq!(latest.queues[0].category, Capability::ContentCreation);
}
