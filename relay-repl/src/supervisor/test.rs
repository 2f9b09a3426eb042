use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use relay_wire::{payload, read_row, write_greeting, write_row, Greeting, ProtocolVersionWire, Row, RowType};

use super::{run_once, run_supervisor, Connector, SupervisorConfig};
use crate::applier::{Applier, ApplierState, Stream};
use crate::config::PeerConfig;
use crate::error::ErrorClass;
use crate::sequencer::Sequencer;
use crate::storage::fake::FakeStorage;
use crate::vclock::Vclock;

/// Hands out one pre-built stream, then fails every call after.
struct SingleUseConnector {
    stream: Mutex<Option<tokio::io::DuplexStream>>,
}

impl Connector for SingleUseConnector {
    fn connect<'a>(
        &'a self,
        _uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Box<dyn Stream>>> + Send + 'a>> {
        Box::pin(async move {
            match self.stream.lock().unwrap().take() {
                Some(s) => Ok(Box::new(s) as Box<dyn Stream>),
                None => Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "already used")),
            }
        })
    }
}

struct AlwaysFailConnector;

impl Connector for AlwaysFailConnector {
    fn connect<'a>(
        &'a self,
        _uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Box<dyn Stream>>> + Send + 'a>> {
        Box::pin(async move { Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nobody home")) })
    }
}

/// Plays the master side of a modern (1.7.7) handshake, then drops the
/// connection once subscribed.
async fn run_fake_master(mut io: tokio::io::DuplexStream, master_uuid: Uuid) {
    write_greeting(
        &mut io,
        &Greeting { protocol: "Binary".to_string(), peer_uuid: master_uuid, version: ProtocolVersionWire(1, 7, 7), salt: vec![] },
    )
    .await
    .unwrap();

    let _vote = read_row(&mut io).await.unwrap();
    write_row(&mut io, &Row::control(RowType::Ok)).await.unwrap();

    let _join = read_row(&mut io).await.unwrap();
    let join_ok = Row::control(RowType::Ok)
        .with_body(payload::OkBody::default())
        .unwrap();
    write_row(&mut io, &join_ok).await.unwrap();
    write_row(&mut io, &Row::control(RowType::Ok)).await.unwrap(); // initial join: nothing to bulk-load
    write_row(&mut io, &Row::control(RowType::Ok)).await.unwrap(); // final join: nothing to catch up

    let _subscribe = read_row(&mut io).await.unwrap();
    let subscribe_ok = Row::control(RowType::Ok)
        .with_body(payload::OkBody {
            vclock: Some(Default::default()),
            cluster_uuid: Some(Uuid::new_v4()),
            ballot: None,
            replica_id: None,
        })
        .unwrap();
    write_row(&mut io, &subscribe_ok).await.unwrap();

    // Dropping `io` here closes the connection once subscribed.
}

#[tokio::test]
async fn run_once_classifies_the_disconnect_after_a_clean_handshake() {
    let (client_io, master_io) = tokio::io::duplex(8192);
    tokio::spawn(run_fake_master(master_io, Uuid::new_v4()));

    let storage = Arc::new(FakeStorage::new());
    let sequencer = Sequencer::new(storage.clone(), storage.clone(), 4, false);
    let applier = Applier::new(&PeerConfig::new("test://peer"), Uuid::new_v4(), Duration::from_secs(1), Duration::from_millis(10));

    let cfg = SupervisorConfig {
        peer: PeerConfig::new("test://peer"),
        instance_uuid: Uuid::new_v4(),
        connector: Arc::new(SingleUseConnector { stream: Mutex::new(Some(client_io)) }),
        credential_store: None,
        replication_timeout: Duration::from_millis(50),
        replication_reconnect_interval: Duration::from_millis(10),
        replication_disconnect_timeout: Duration::from_secs(1),
        replication_sync_lag: Duration::from_millis(10),
    };

    let result = tokio::time::timeout(Duration::from_secs(2), run_once(&applier, &cfg, &Vclock::new(), &sequencer))
        .await
        .expect("run_once must not hang");
    let err = result.expect_err("the master drops the connection once subscribed");
    assert_eq!(err.class, ErrorClass::Disconnected);
    assert_eq!(applier.state(), ApplierState::Sync, "run_once itself doesn't touch applier state on failure");
}

#[tokio::test]
async fn run_supervisor_marks_the_applier_disconnected_and_stops_on_shutdown() {
    let storage = Arc::new(FakeStorage::new());
    let sequencer = Sequencer::new(storage.clone(), storage.clone(), 4, false);

    let cfg = SupervisorConfig {
        peer: PeerConfig::new("test://nowhere"),
        instance_uuid: Uuid::new_v4(),
        connector: Arc::new(AlwaysFailConnector),
        credential_store: None,
        replication_timeout: Duration::from_millis(20),
        replication_reconnect_interval: Duration::from_millis(10),
        replication_disconnect_timeout: Duration::from_millis(50),
        replication_sync_lag: Duration::from_millis(10),
    };

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(run_supervisor(cfg, sequencer, rx));
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    let applier = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("run_supervisor must not hang")
        .expect("supervisor task must not panic");
    assert_eq!(applier.state(), ApplierState::Disconnected);
}
