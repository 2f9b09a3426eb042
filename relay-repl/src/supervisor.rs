//! The per-peer reconnect loop (§4.5): connect, hand off to the
//! sequencer, wait for the connection to end, classify why, and decide
//! whether to retry.
//!
//! Opening the actual socket is behind `Connector` so this loop can be
//! driven against an in-memory peer in tests; the `relay` binary wires
//! in `TcpConnector` for real deployments.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::applier::{Applier, Stream, Subscribed};
use crate::config::PeerConfig;
use crate::error::{ErrorClass, ReplicationError};
use crate::notify::LastError;
use crate::sequencer::Sequencer;
use crate::storage::CredentialStore;
use crate::vclock::Vclock;

/// Turns a classified `LastError` back into a `ReplicationError` so the
/// applier's own observable state reflects why the supervisor is
/// retrying or giving up, not just the sequencer's diagnostic slot.
fn synthesize_error(class: ErrorClass, message: String) -> ReplicationError {
    match class {
        ErrorClass::Off => ReplicationError::Cancelled,
        ErrorClass::Disconnected => ReplicationError::Socket(std::io::Error::other(message)),
        ErrorClass::Loading => ReplicationError::Loading(message),
        ErrorClass::Stopped => ReplicationError::Wire(message),
    }
}

/// How the applier opens the byte stream to a peer (§4.1 Connect). A
/// seam rather than a bare `TcpStream::connect` call so the handshake
/// can be driven over an in-memory stream in tests.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Box<dyn Stream>>> + Send + 'a>>;
}

pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Box<dyn Stream>>> + Send + 'a>> {
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect(uri).await?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream) as Box<dyn Stream>)
        })
    }
}

/// Everything a supervisor needs that doesn't change across reconnects.
pub struct SupervisorConfig {
    pub peer: PeerConfig,
    pub instance_uuid: Uuid,
    pub connector: Arc<dyn Connector>,
    pub credential_store: Option<Arc<dyn CredentialStore>>,
    pub replication_timeout: Duration,
    pub replication_reconnect_interval: Duration,
    pub replication_disconnect_timeout: Duration,
    pub replication_sync_lag: Duration,
}

/// Drives one peer's applier through repeated connect/join/subscribe
/// cycles until a terminal error is classified or `shutdown` fires.
/// Returns the `Applier` handle so the caller can still inspect its
/// last known state after the loop exits.
pub async fn run_supervisor(cfg: SupervisorConfig, sequencer: Sequencer, mut shutdown: watch::Receiver<bool>) -> Applier {
    let applier = Applier::new(
        &cfg.peer,
        cfg.instance_uuid,
        cfg.replication_disconnect_timeout,
        cfg.replication_sync_lag,
    );
    let mut last_logged: Option<LastError> = None;

    loop {
        if *shutdown.borrow() {
            return applier;
        }

        let local_vclock = sequencer.tx_vclock();
        let outcome = run_once(&applier, &cfg, &local_vclock, &sequencer).await;
        let err = match outcome {
            Ok(()) => continue,
            Err(e) => e,
        };
        applier.mark_disconnected(synthesize_error(err.class, err.message.clone()));

        if last_logged.as_ref() != Some(&err) {
            tracing::warn!(peer = %applier.peer_uri, class = ?err.class, message = %err.message, "applier connection failed");
            last_logged = Some(err.clone());
        } else {
            tracing::debug!(peer = %applier.peer_uri, "applier connection failed again (repeat suppressed)");
        }

        match err.class {
            ErrorClass::Off | ErrorClass::Stopped => return applier,
            ErrorClass::Disconnected | ErrorClass::Loading => {
                tokio::select! {
                    _ = tokio::time::sleep(cfg.replication_reconnect_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// One connect-join-subscribe-and-run cycle. Blocks until the resulting
/// connection is detached, then surfaces why.
async fn run_once(
    applier: &Applier,
    cfg: &SupervisorConfig,
    local_vclock: &Vclock,
    sequencer: &Sequencer,
) -> Result<(), LastError> {
    let stream = cfg
        .connector
        .connect(&cfg.peer.uri)
        .await
        .map_err(|e| LastError { class: ErrorClass::Disconnected, message: e.to_string() })?;

    let credentials = cfg.peer.login.clone().zip(cfg.peer.password.clone());
    let credential_store = cfg.credential_store.as_deref();

    let subscribed = applier
        .handshake(stream, credentials.as_ref(), credential_store, sequencer, local_vclock)
        .await
        .map_err(|e| LastError::from(&e))?;

    let Subscribed { reader, writer, remote_vclock_at_subscribe, heartbeats_supported, writer_task_supported } =
        subscribed;

    let handle = sequencer.attach(applier.clone(), reader, remote_vclock_at_subscribe, cfg.replication_disconnect_timeout);

    if writer_task_supported {
        let legacy_timeout = (!heartbeats_supported).then_some(cfg.replication_timeout);
        tokio::spawn(crate::writer::run_writer_task(
            applier.clone(),
            writer,
            handle.clone(),
            sequencer.clone(),
            legacy_timeout,
        ));
    }

    handle.wait_done().await;
    match handle.diagnostic() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test;
