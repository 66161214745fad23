use anyhow::Result;
use clap::{Parser, Subcommand};
use csync_sync::ReconcileConfig;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "csync")]
#[command(about = "Reconcile a remote contact group with the canonical registry")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and report its status.
    Sync,
    /// Run passes on the configured cron until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "csync_sync=info,csync_adapters=info,csync_transport=info,warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = csync_sync::run_sync_once_from_env().await?;
            let c = &summary.counters;
            println!(
                "sync complete: run_id={} members={} matched={} created={} ambiguous={} patched={} write_batches={}",
                summary.run_id, c.members, c.matched, c.created, c.ambiguous, c.patched, c.write_batches
            );
        }
        Commands::Schedule => {
            let config = ReconcileConfig::from_env()?;
            csync_sync::run_scheduled(config, async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "listening for ctrl-c failed; stopping");
                }
            })
            .await?;
        }
    }

    Ok(())
}
