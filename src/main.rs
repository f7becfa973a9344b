use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use relay_core::memory::{MemoryProviders, Seed};
use relay_hub::{EventHub, HubConfig};
use relay_server::ServerConfig;
use relay_telemetry::{init_telemetry, TelemetryConfig};

/// Relay dev server: the event-distribution engine wired to in-memory
/// collaborators. Production deployments embed the crates and supply real
/// directory/store implementations.
#[derive(Parser)]
#[command(name = "relay", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9102)]
    port: u16,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Metrics push interval in seconds.
    #[arg(long, default_value_t = 1)]
    metrics_secs: u64,

    /// Stale-session sweep interval in seconds.
    #[arg(long, default_value_t = 60)]
    sweep_secs: u64,

    /// Age in seconds after which a session without a heartbeat is removed.
    #[arg(long, default_value_t = 90)]
    stale_secs: u64,

    /// JSON file seeding the in-memory users/teams/analyses.
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_telemetry(TelemetryConfig {
        json_output: args.json_logs,
        ..Default::default()
    });

    let providers = match &args.seed {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            let seed: Seed = serde_json::from_str(&raw)?;
            tracing::info!(path = %path.display(), "loaded collaborator seed");
            MemoryProviders::from_seed(seed)
        }
        None => MemoryProviders::new(),
    };

    let config = HubConfig {
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
        metrics_interval: Duration::from_secs(args.metrics_secs),
        sweep_interval: Duration::from_secs(args.sweep_secs),
        stale_after: Duration::from_secs(args.stale_secs),
        ..Default::default()
    };
    let hub = Arc::new(EventHub::new(
        config,
        providers.auth.clone(),
        providers.analyses.clone(),
        providers.teams.clone(),
        providers.users.clone(),
        providers.metrics.clone(),
    ));

    let handle = relay_server::start(ServerConfig { port: args.port }, Arc::clone(&hub)).await?;
    tracing::info!(port = handle.port, "relay ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
