//! `counsel`: run the firm's scheduled marketing agents.

mod collaborators;

use anyhow::Context;
use clap::{Parser, Subcommand};
use collaborators::{DryRunCollaborator, LoggingResultHandler, WebhookCollaborator};
use counsel_orchestrator::{
    CapabilityBindings, Capability, Collaborator, CronSchedule, FanoutSink, JsonlSink,
    Orchestrator, OrchestratorConfig, TracingSink,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "counsel", about = "Run and inspect the scheduled agent orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "counsel.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config and show upcoming fire times
    Check {
        /// Fire times to show per agent
        #[arg(short, long, default_value_t = 3)]
        count: usize,
    },
    /// List the agent roster
    Agents,
    /// Run the orchestrator until Ctrl-C
    Run {
        /// Log tasks instead of calling configured endpoints
        #[arg(long)]
        dry_run: bool,
    },
}

/// Missing file means defaults with the built-in roster.
fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(OrchestratorConfig::default());
    }
    OrchestratorConfig::load(path)
        .with_context(|| format!("Failed to load config '{}'", path.display()))
}

fn bindings(config: &OrchestratorConfig, dry_run: bool) -> CapabilityBindings {
    let handler = Arc::new(LoggingResultHandler);
    let mut bindings = CapabilityBindings::new();
    for capability in Capability::ALL {
        let endpoint = config
            .collaborators
            .get(&capability)
            .and_then(|c| c.endpoint.as_deref().map(|e| (e, c)));
        let collaborator: Arc<dyn Collaborator> = match endpoint {
            Some((endpoint, collaborator)) if !dry_run => {
                info!(category = %capability, endpoint, "Webhook collaborator bound");
                Arc::new(WebhookCollaborator::new(endpoint, collaborator))
            }
            _ => Arc::new(DryRunCollaborator),
        };
        bindings = bindings.bind(capability, collaborator, handler.clone());
    }
    bindings
}

fn check(config: &OrchestratorConfig, count: usize) -> anyhow::Result<()> {
    config.validate()?;
    let now = chrono::Utc::now();
    for agent in config.agents() {
        let schedule = CronSchedule::parse(&agent.schedule)?;
        let mut fires = Vec::with_capacity(count);
        let mut cursor = now;
        while fires.len() < count {
            let Some(next) = schedule.next_after(cursor) else {
                break;
            };
            fires.push(next.format("%Y-%m-%d %H:%M UTC").to_string());
            cursor = next;
        }
        println!("{:<22} {:<16} {}", agent.id, agent.schedule, fires.join(", "));
    }
    println!("Config OK");
    Ok(())
}

fn list_agents(config: &OrchestratorConfig) {
    println!(
        "{:<22} {:<18} {:<18} {:>4} {:>4} ENABLED",
        "ID", "CAPABILITY", "SCHEDULE", "PRIO", "CONC"
    );
    for agent in config.agents() {
        println!(
            "{:<22} {:<18} {:<18} {:>4} {:>4} {}",
            agent.id,
            agent.capability,
            agent.schedule,
            agent.priority,
            agent.max_concurrency,
            agent.enabled
        );
    }
}

async fn run(config: OrchestratorConfig, dry_run: bool) -> anyhow::Result<()> {
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(Arc::new(JsonlSink::new(config.data_dir.clone())));
    let bindings = bindings(&config, dry_run);
    let orchestrator = Orchestrator::builder(config)
        .bindings(bindings)
        .sink(Arc::new(sink))
        .build()?;

    orchestrator.start().await?;
    info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    orchestrator.stop().await;
    let metrics = serde_json::to_string_pretty(&orchestrator.get_metrics())?;
    println!("{metrics}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    counsel_core::telemetry::init_tracing(cli.json_logs);

    let config = load_config(&cli.config)?;
    match cli.command {
        Commands::Check { count } => check(&config, count),
        Commands::Agents => {
            list_agents(&config);
            Ok(())
        }
        Commands::Run { dry_run } => run(config, dry_run).await,
    }
}
