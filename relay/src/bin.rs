use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use relay::memory::{InMemoryStorage, NullCredentialStore};
use relay::Collaborators;

#[derive(Parser)]
#[command(name = "relay", about = "Replication applier and transaction sequencer")]
struct Cli {
    /// Path to a TOML configuration file. Omit to run on defaults plus
    /// environment overrides.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured log level (e.g. "debug", "relay=trace").
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the replica and block until shutdown.
    Run,
}

#[tokio::main]
async fn main() -> relay_base::Result<()> {
    let cli = Cli::parse();
    let mut config = relay::load_config(cli.config.as_deref())?;
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }
    relay::init_tracing(&config.log_level);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
    }
}

async fn run(config: relay_repl::Config) -> relay_base::Result<()> {
    tracing::info!(peers = config.peers.len(), instance_uuid = %config.instance_uuid, "starting relay");

    let storage = Arc::new(InMemoryStorage::new());
    let collaborators = Collaborators {
        storage: storage.clone(),
        wal: storage,
        credential_store: Some(Arc::new(NullCredentialStore)),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sequencer, supervisors) = relay::spawn(&config, collaborators, shutdown_rx);

    tokio::signal::ctrl_c().await.map_err(relay_base::Error::new)?;
    tracing::info!("shutdown signal received, draining");
    shutdown_tx.send(true).ok();
    sequencer.shutdown();

    for supervisor in supervisors {
        if let Err(e) = supervisor.await {
            tracing::warn!(error = %e, "supervisor task panicked during shutdown");
        }
    }

    Ok(())
}
