use crate::types::{Capability, DeadLetter, HandlerOutcome, HealthSnapshot};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Structured event published by the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// Periodic health snapshot.
    Health(HealthSnapshot),
    /// A task was given up on.
    DeadLetter(DeadLetter),
    /// An attempt succeeded and was acked.
    TaskSucceeded {
        /// Task id.
        task_id: Uuid,
        /// Owning agent.
        agent_id: String,
        /// Task category.
        category: Capability,
        /// Collaborator plus handler time.
        duration_ms: u64,
        /// What the handler reported.
        outcome: HandlerOutcome,
    },
    /// An attempt failed.
    TaskFailed {
        /// Task id.
        task_id: Uuid,
        /// Owning agent.
        agent_id: String,
        /// Task category.
        category: Capability,
        /// 1-based attempt number.
        attempt: u32,
        /// Why the attempt failed.
        error: String,
    },
}

/// Transport-agnostic receiver of orchestrator events.
///
/// `emit` is called from worker tasks and must not block.
#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    /// Publish one event.
    fn emit(&self, event: &OrchestratorEvent);

    /// Wait until previously emitted events are durable.
    async fn flush(&self) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl ObservabilitySink for TracingSink {
    fn emit(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::Health(snapshot) => {
                let healthy = snapshot.is_healthy();
                let unreachable = snapshot.queues.iter().filter(|q| !q.reachable).count();
                let dead_letters: usize = snapshot.queues.iter().map(|q| q.dead_letters).sum();
                let (memory_bytes, cpu_percent) = snapshot
                    .process
                    .as_ref()
                    .map_or((0, 0.0), |p| (p.memory_bytes, p.cpu_percent));
                if healthy {
                    info!(
                        uptime_secs = snapshot.uptime_secs,
                        agents = snapshot.agents.len(),
                        memory_bytes,
                        cpu_percent,
                        "Health snapshot"
                    );
                } else {
                    warn!(
                        uptime_secs = snapshot.uptime_secs,
                        unreachable_queues = unreachable,
                        dead_letters,
                        memory_bytes,
                        cpu_percent,
                        "Health snapshot degraded"
                    );
                }
            }
            OrchestratorEvent::DeadLetter(letter) => {
                error!(
                    task_id = %letter.task.id,
                    agent_id = %letter.task.agent_id,
                    category = %letter.task.category,
                    attempts = letter.attempts,
                    reason = %letter.reason,
                    "Task dead-lettered"
                );
            }
            OrchestratorEvent::TaskSucceeded {
                task_id,
                agent_id,
                duration_ms,
                ..
            } => {
                info!(task_id = %task_id, agent_id = %agent_id, duration_ms, "Task succeeded");
            }
            OrchestratorEvent::TaskFailed {
                task_id,
                agent_id,
                attempt,
                error,
                ..
            } => {
                warn!(task_id = %task_id, agent_id = %agent_id, attempt, error = %error, "Task failed");
            }
        }
    }
}

/// Dead letters written by [`JsonlSink`], one per line.
pub const DEAD_LETTER_FILE: &str = "dead_letters.jsonl";
/// Health snapshots written by [`JsonlSink`], one per line.
pub const HEALTH_FILE: &str = "health.jsonl";

enum WriterCommand {
    Append { file: &'static str, line: String },
    Flush(oneshot::Sender<()>),
}

/// Append-only JSONL persistence of dead letters and health snapshots.
///
/// A background task owns the files; `emit` only serializes and sends.
pub struct JsonlSink {
    dir: PathBuf,
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl JsonlSink {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterCommand>();
        let writer_dir = dir.clone();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&writer_dir).await {
                warn!(dir = %writer_dir.display(), error = %e, "Cannot create data directory");
            }
            while let Some(command) = rx.recv().await {
                match command {
                    WriterCommand::Append { file, line } => {
                        if let Err(e) = append_line(&writer_dir.join(file), &line).await {
                            warn!(file, error = %e, "Failed to persist event");
                        }
                    }
                    WriterCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { dir, tx }
    }

    /// Directory the files are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await
}

#[async_trait]
impl ObservabilitySink for JsonlSink {
    fn emit(&self, event: &OrchestratorEvent) {
        let (file, serialized) = match event {
            OrchestratorEvent::Health(snapshot) => (HEALTH_FILE, serde_json::to_string(snapshot)),
            OrchestratorEvent::DeadLetter(letter) => (DEAD_LETTER_FILE, serde_json::to_string(letter)),
            _ => return,
        };
        match serialized {
            Ok(line) => {
                let _ = self.tx.send(WriterCommand::Append { file, line });
            }
            Err(e) => warn!(error = %e, "Failed to serialize event"),
        }
    }

    async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl FanoutSink {
    /// Fanout with no sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of inner sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether there are no inner sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl ObservabilitySink for FanoutSink {
    fn emit(&self, event: &OrchestratorEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }

    async fn flush(&self) {
        for sink in &self.sinks {
            sink.flush().await;
        }
    }
}
