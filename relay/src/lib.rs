//! Process wiring for a single replica: load configuration, initialize
//! tracing, construct the sequencer, and spawn one supervisor per
//! configured peer. The `relay` binary (`src/bin.rs`) is a thin CLI
//! shell around this crate.

mod config_file;
pub mod memory;

pub use config_file::load_config;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use relay_repl::{
    run_supervisor, Config, Connector, CredentialStore, Sequencer, Storage, SupervisorConfig, TcpConnector, WalSink,
};

/// The collaborators this subsystem doesn't implement itself (§6):
/// storage engine, WAL sink, and credential store. A real deployment
/// wires in adapters over its actual storage engine; `relay::memory`
/// supplies a placeholder so the binary runs standalone.
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub wal: Arc<dyn WalSink>,
    pub credential_store: Option<Arc<dyn CredentialStore>>,
}

/// Initializes the global tracing subscriber from `RUST_LOG` if set,
/// falling back to `log_level`. Intended to be called exactly once, at
/// process startup.
pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Builds the sequencer and spawns one supervisor task per configured
/// peer, each watching `shutdown` for graceful termination. Returns the
/// `Sequencer` handle and the join handle for every spawned supervisor
/// task, so a caller can await their completion after signaling
/// shutdown (§4.7: graceful shutdown awaits every worker it spawned).
pub fn spawn(
    config: &Config,
    collaborators: Collaborators,
    shutdown: watch::Receiver<bool>,
) -> (Sequencer, Vec<JoinHandle<()>>) {
    let sequencer = Sequencer::new(
        collaborators.storage,
        collaborators.wal,
        config.sequencer_max_workers,
        config.replication_skip_conflict,
    );

    let connector: Arc<dyn Connector> = Arc::new(TcpConnector);
    let mut supervisors = Vec::with_capacity(config.peers.len());
    for peer in &config.peers {
        let cfg = SupervisorConfig {
            peer: peer.clone(),
            instance_uuid: config.instance_uuid,
            connector: connector.clone(),
            credential_store: collaborators.credential_store.clone(),
            replication_timeout: config.replication_timeout,
            replication_reconnect_interval: config.replication_reconnect_interval,
            replication_disconnect_timeout: config.replication_disconnect_timeout,
            replication_sync_lag: config.replication_sync_lag,
        };
        let peer_sequencer = sequencer.clone();
        let peer_shutdown = shutdown.clone();
        supervisors.push(tokio::spawn(async move {
            let applier = run_supervisor(cfg, peer_sequencer, peer_shutdown).await;
            tracing::info!(peer = %applier.peer_uri, state = ?applier.state(), "supervisor exited");
        }));
    }

    (sequencer, supervisors)
}
