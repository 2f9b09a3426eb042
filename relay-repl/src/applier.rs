//! The per-peer applier state machine (§4.1): connect, authenticate,
//! optionally join, subscribe, then stream rows until something knocks
//! the connection over.
//!
//! The handshake (`Connect` through `Subscribe`) runs directly against
//! whatever `Stream` the caller hands in, so it's agnostic to whether
//! that's a real `TcpStream` or an in-memory `tokio::io::DuplexStream`
//! used in tests. Once subscribed, the connection is split and handed
//! off behind the `RowReader`/`RowWriter` seams: the sequencer's worker
//! pool reads rows through the former, the writer task sends ACKs
//! through the latter. Neither of those later consumers needs to know
//! what kind of stream is underneath.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{self, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use uuid::Uuid;

use relay_wire::{
    gate, payload, read_greeting, read_row_timeout, write_row, Greeting, ProtocolVersion, ReplicaId, Row,
    RowType,
};

use crate::config::PeerConfig;
use crate::error::ReplicationError;
use crate::notify::{AwaitError, LastError, Notifier};
use crate::sequencer::Sequencer;
use crate::storage::CredentialStore;
use crate::vclock::Vclock;

/// Any full-duplex byte stream the handshake can run over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Stream for T {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplierState {
    Off,
    Connect,
    Connected,
    Auth,
    Ready,
    InitialJoin,
    FinalJoin,
    Joined,
    Sync,
    Follow,
    Disconnected,
    Loading,
    Stopped,
}

impl ApplierState {
    pub fn is_ack_eligible(self) -> bool {
        matches!(self, ApplierState::Sync | ApplierState::Follow)
    }
}

/// Reads one row at a time from whatever replaced the applier's raw
/// connection once it handed the read half to the sequencer (§3
/// Ownership). A boxed future rather than an async-trait method, to
/// avoid pulling in a new dependency for one seam.
pub trait RowReader: Send {
    fn read_row<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Row, ReplicationError>> + Send + 'a>>;
}

pub trait RowWriter: Send {
    fn write_row<'a>(
        &'a mut self,
        row: &'a Row,
    ) -> Pin<Box<dyn Future<Output = Result<(), ReplicationError>> + Send + 'a>>;
}

struct NetRowReader<R> {
    io: R,
}

impl<R: AsyncRead + Unpin + Send> RowReader for NetRowReader<R> {
    fn read_row<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Row, ReplicationError>> + Send + 'a>> {
        Box::pin(async move {
            read_row_timeout(&mut self.io, timeout)
                .await
                .map_err(ReplicationError::from)
        })
    }
}

struct NetRowWriter<W> {
    io: W,
}

impl<W: AsyncWrite + Unpin + Send> RowWriter for NetRowWriter<W> {
    fn write_row<'a>(
        &'a mut self,
        row: &'a Row,
    ) -> Pin<Box<dyn Future<Output = Result<(), ReplicationError>> + Send + 'a>> {
        Box::pin(async move { write_row(&mut self.io, row).await.map_err(ReplicationError::from) })
    }
}

/// Everything the handshake produced, handed off to the supervisor so it
/// can attach to the sequencer and spawn the writer task (§4.1, §4.3).
pub struct Subscribed {
    pub reader: Box<dyn RowReader>,
    pub writer: Box<dyn RowWriter>,
    pub remote_vclock_at_subscribe: Vclock,
    pub heartbeats_supported: bool,
    pub writer_task_supported: bool,
}

struct Shared {
    state: Mutex<ApplierState>,
    peer_uuid: Mutex<Option<Uuid>>,
    protocol_version: Mutex<Option<ProtocolVersion>>,
    lag: Mutex<Duration>,
    last_error: Mutex<Option<LastError>>,
    notifier: Notifier,
}

/// One applier per master peer (§3). Cloning an `Applier` is cheap and
/// shares the same underlying state; the supervisor, writer task, and
/// any external controller each hold a clone.
#[derive(Clone)]
pub struct Applier {
    pub peer_uri: String,
    instance_uuid: Uuid,
    replicaset_uuid: std::sync::Arc<Mutex<Option<Uuid>>>,
    local_replica_id: std::sync::Arc<Mutex<Option<ReplicaId>>>,
    disconnect_timeout: Duration,
    sync_lag: Duration,
    shared: std::sync::Arc<Shared>,
}

impl Applier {
    pub fn new(peer: &PeerConfig, instance_uuid: Uuid, disconnect_timeout: Duration, sync_lag: Duration) -> Self {
        Applier {
            peer_uri: peer.uri.clone(),
            instance_uuid,
            replicaset_uuid: std::sync::Arc::new(Mutex::new(None)),
            local_replica_id: std::sync::Arc::new(Mutex::new(None)),
            disconnect_timeout,
            sync_lag,
            shared: std::sync::Arc::new(Shared {
                state: Mutex::new(ApplierState::Off),
                peer_uuid: Mutex::new(None),
                protocol_version: Mutex::new(None),
                lag: Mutex::new(Duration::ZERO),
                last_error: Mutex::new(None),
                notifier: Notifier::new(),
            }),
        }
    }

    pub fn state(&self) -> ApplierState {
        *self.shared.state.lock().unwrap()
    }

    pub fn replicaset_uuid(&self) -> Option<Uuid> {
        *self.replicaset_uuid.lock().unwrap()
    }

    pub fn set_replicaset_uuid(&self, uuid: Uuid) {
        *self.replicaset_uuid.lock().unwrap() = Some(uuid);
    }

    pub fn local_replica_id(&self) -> Option<ReplicaId> {
        *self.local_replica_id.lock().unwrap()
    }

    fn set_local_replica_id(&self, id: ReplicaId) {
        *self.local_replica_id.lock().unwrap() = Some(id);
    }

    pub fn lag(&self) -> Duration {
        *self.shared.lag.lock().unwrap()
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.shared.last_error.lock().unwrap().clone()
    }

    fn set_state(&self, new: ApplierState) {
        *self.shared.state.lock().unwrap() = new;
        self.shared.notifier.on_state_change(new);
        tracing::info!(peer = %self.peer_uri, ?new, "applier state change");
    }

    fn fail(&self, e: ReplicationError) -> ReplicationError {
        *self.shared.last_error.lock().unwrap() = Some(LastError::from(&e));
        let next = match e.classify() {
            crate::error::ErrorClass::Off => ApplierState::Off,
            crate::error::ErrorClass::Disconnected => ApplierState::Disconnected,
            crate::error::ErrorClass::Loading => ApplierState::Loading,
            crate::error::ErrorClass::Stopped => ApplierState::Stopped,
        };
        self.set_state(next);
        e
    }

    /// Gate a caller's async action on this applier reaching `desired`
    /// within `deadline` (§4.4). Pauses the applier's reader on success;
    /// the caller must call `resume()` once done.
    pub async fn await_state(
        &self,
        desired: ApplierState,
        deadline: Duration,
    ) -> Result<ApplierState, AwaitError> {
        self.shared
            .notifier
            .await_state(desired, deadline, || self.last_error())
            .await
    }

    pub fn resume(&self) {
        self.shared.notifier.resume();
    }

    pub(crate) async fn wait_while_paused(&self) {
        self.shared.notifier.wait_while_paused().await;
    }

    /// Run the full handshake: `Connect -> [Auth ->] Ready -> (Join) ->
    /// Subscribe`. On success the connection is split and handed back as
    /// a `Subscribed` bundle; on failure the applier is left in whatever
    /// terminal-or-retryable state `fail()` put it in and the error is
    /// returned for the supervisor to classify.
    pub async fn handshake<S: Stream>(
        &self,
        mut stream: S,
        credentials: Option<&(String, String)>,
        credential_store: Option<&dyn CredentialStore>,
        sequencer: &Sequencer,
        local_vclock: &Vclock,
    ) -> Result<Subscribed, ReplicationError> {
        self.set_state(ApplierState::Connect);
        self.wait_while_paused().await;
        let greeting = self.read_greeting(&mut stream).await?;
        if greeting.protocol != "Binary" {
            return Err(self.fail(ReplicationError::Protocol(format!(
                "unexpected protocol name {:?}",
                greeting.protocol
            ))));
        }
        if greeting.peer_uuid == self.instance_uuid {
            return Err(self.fail(ReplicationError::ConnectionToSelf));
        }
        *self.shared.peer_uuid.lock().unwrap() = Some(greeting.peer_uuid);
        let version = greeting.protocol_version();
        *self.shared.protocol_version.lock().unwrap() = Some(version);

        self.vote(&mut stream).await?;
        self.set_state(ApplierState::Connected);
        self.wait_while_paused().await;

        if let (Some((login, password)), Some(store)) = (credentials, credential_store) {
            self.set_state(ApplierState::Auth);
            self.wait_while_paused().await;
            self.auth(&mut stream, &greeting.salt, login, password, store).await?;
        }
        self.set_state(ApplierState::Ready);
        self.wait_while_paused().await;

        let mut local_vclock = local_vclock.clone();
        if self.replicaset_uuid().is_none() {
            local_vclock = self.join(&mut stream, version, sequencer, &local_vclock).await?;
            self.set_state(ApplierState::Ready);
            self.wait_while_paused().await;
        }

        let subscribed = self.subscribe(stream, version, &local_vclock).await?;
        Ok(subscribed)
    }

    async fn read_greeting<S: Stream>(&self, stream: &mut S) -> Result<Greeting, ReplicationError> {
        read_greeting(stream)
            .await
            .map_err(|e| self.fail(ReplicationError::from(e)))
    }

    async fn request<S: Stream>(&self, stream: &mut S, req: Row) -> Result<Row, ReplicationError> {
        write_row(stream, &req)
            .await
            .map_err(|e| self.fail(ReplicationError::from(e)))?;
        let resp = read_row_timeout(stream, self.disconnect_timeout)
            .await
            .map_err(|e| self.fail(ReplicationError::from(e)))?;
        if resp.row_type == RowType::Error {
            let body: payload::ErrorBody = resp
                .decode_body()
                .map_err(|e| self.fail(ReplicationError::from(e)))?;
            // An `UnknownRequestType` error on a `Vote` is deliberately
            // ignored by the caller; everything else is surfaced.
            return Err(ReplicationError::from_wire(body.code, body.message));
        }
        Ok(resp)
    }

    async fn vote<S: Stream>(&self, stream: &mut S) -> Result<(), ReplicationError> {
        let req = Row::control(RowType::Vote);
        match self.request(stream, req).await {
            Ok(_ok) => Ok(()),
            Err(ReplicationError::UnknownRequestType(_)) => {
                // Peer doesn't know `Vote`; tolerated (§4.1).
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn auth<S: Stream>(
        &self,
        stream: &mut S,
        salt: &[u8],
        login: &str,
        password: &str,
        store: &dyn CredentialStore,
    ) -> Result<(), ReplicationError> {
        let scramble = store.auth_reply(salt, login, password);
        let req = Row::control(RowType::Auth)
            .with_body(payload::AuthRequest {
                login: login.to_string(),
                scramble,
            })
            .map_err(|e| self.fail(ReplicationError::from(e)))?;
        self.request(stream, req).await.map(|_| ()).map_err(|e| self.fail(e))
    }

    async fn join<S: Stream>(
        &self,
        stream: &mut S,
        version: ProtocolVersion,
        sequencer: &Sequencer,
        local_vclock: &Vclock,
    ) -> Result<Vclock, ReplicationError> {
        let req = Row::control(RowType::Join)
            .with_body(payload::JoinRequest {
                instance_uuid: self.instance_uuid,
            })
            .map_err(|e| self.fail(ReplicationError::from(e)))?;
        write_row(stream, &req)
            .await
            .map_err(|e| self.fail(ReplicationError::from(e)))?;

        let supports_start_vclock = version.at_least(
            gate::JOIN_START_VCLOCK.major,
            gate::JOIN_START_VCLOCK.minor,
            gate::JOIN_START_VCLOCK.patch,
        );
        let mut vclock = local_vclock.clone();
        if supports_start_vclock {
            let resp = read_row_timeout(stream, self.disconnect_timeout)
                .await
                .map_err(|e| self.fail(ReplicationError::from(e)))?;
            if resp.row_type == RowType::Error {
                let body: payload::ErrorBody = resp.decode_body().map_err(|e| self.fail(ReplicationError::from(e)))?;
                return Err(self.fail(ReplicationError::from_wire(body.code, body.message)));
            }
            let ok: payload::OkBody = resp.decode_body().map_err(|e| self.fail(ReplicationError::from(e)))?;
            if let Some(wire) = ok.vclock {
                vclock = Vclock::from_wire(&wire);
                sequencer.seed_vclock(&vclock);
            }
        }

        self.set_state(ApplierState::InitialJoin);
        self.wait_while_paused().await;
        self.consume_join_stream(stream, true, sequencer, &mut vclock).await?;

        // Legacy peers (< 1.7.0) have no separate final-join stream: they
        // merge it into `Subscribe` and signal completion there by
        // assigning a replica id (§4.1). Only run the second stream on
        // peers new enough to send one -- a legacy master never sends the
        // terminating `Ok` this would wait for.
        if supports_start_vclock {
            self.set_state(ApplierState::FinalJoin);
            self.wait_while_paused().await;
            self.consume_join_stream(stream, false, sequencer, &mut vclock).await?;
        }

        self.set_state(ApplierState::Joined);
        self.wait_while_paused().await;
        Ok(vclock)
    }

    /// Consume one `Ok`-terminated stream of DML rows during join.
    /// `initial` selects the bulk-load apply path (no vclock advance, no
    /// secondary index maintenance) vs. the final-join path (each row
    /// advances the vclock and is applied and committed normally).
    async fn consume_join_stream<S: Stream>(
        &self,
        stream: &mut S,
        initial: bool,
        sequencer: &Sequencer,
        vclock: &mut Vclock,
    ) -> Result<(), ReplicationError> {
        loop {
            let row = read_row_timeout(stream, self.disconnect_timeout)
                .await
                .map_err(|e| self.fail(ReplicationError::from(e)))?;
            match row.row_type {
                RowType::Ok => return Ok(()),
                RowType::Error => {
                    let body: payload::ErrorBody =
                        row.decode_body().map_err(|e| self.fail(ReplicationError::from(e)))?;
                    return Err(self.fail(ReplicationError::from_wire(body.code, body.message)));
                }
                RowType::Dml | RowType::Nop => {
                    if initial {
                        sequencer
                            .apply_initial_join_row(&row)
                            .map_err(|e| self.fail(ReplicationError::Protocol(e.to_string())))?;
                    } else {
                        vclock.follow(row.replica_id, row.lsn);
                        sequencer
                            .apply_final_join_row(&row)
                            .map_err(|e| self.fail(ReplicationError::from(e)))?;
                    }
                }
                other => {
                    return Err(self.fail(ReplicationError::Protocol(format!(
                        "unexpected row type {other:?} in join stream"
                    ))))
                }
            }
        }
    }

    async fn subscribe<S: Stream>(
        &self,
        mut stream: S,
        version: ProtocolVersion,
        local_vclock: &Vclock,
    ) -> Result<Subscribed, ReplicationError> {
        let cluster_uuid = self.replicaset_uuid().unwrap_or_default();
        let req = Row::control(RowType::Subscribe)
            .with_body(payload::SubscribeRequest {
                cluster_uuid,
                instance_uuid: self.instance_uuid,
                vclock: local_vclock.to_wire(),
            })
            .map_err(|e| self.fail(ReplicationError::from(e)))?;
        write_row(&mut stream, &req)
            .await
            .map_err(|e| self.fail(ReplicationError::from(e)))?;

        let has_body = version.at_least(
            gate::SUBSCRIBE_RESPONSE_BODY.major,
            gate::SUBSCRIBE_RESPONSE_BODY.minor,
            gate::SUBSCRIBE_RESPONSE_BODY.patch,
        );
        let mut remote_vclock_at_subscribe = Vclock::new();
        if has_body {
            let resp = read_row_timeout(&mut stream, self.disconnect_timeout)
                .await
                .map_err(|e| self.fail(ReplicationError::from(e)))?;
            if resp.row_type == RowType::Error {
                let body: payload::ErrorBody =
                    resp.decode_body().map_err(|e| self.fail(ReplicationError::from(e)))?;
                return Err(self.fail(ReplicationError::from_wire(body.code, body.message)));
            }
            let ok: payload::OkBody = resp.decode_body().map_err(|e| self.fail(ReplicationError::from(e)))?;
            if let Some(peer_cluster_uuid) = ok.cluster_uuid {
                if cluster_uuid != Uuid::nil() && peer_cluster_uuid != cluster_uuid {
                    return Err(self.fail(ReplicationError::ReplicasetUuidMismatch {
                        expected: cluster_uuid,
                        actual: peer_cluster_uuid,
                    }));
                }
                self.set_replicaset_uuid(peer_cluster_uuid);
            }
            if let Some(wire) = ok.vclock {
                remote_vclock_at_subscribe = Vclock::from_wire(&wire);
            }
            if let Some(replica_id) = ok.replica_id {
                // Legacy peers complete final-join here, the moment a
                // replica id has been assigned (§4.1).
                self.set_local_replica_id(replica_id);
            }
        }

        let heartbeats_supported = version.at_least(
            gate::PERIODIC_HEARTBEATS.major,
            gate::PERIODIC_HEARTBEATS.minor,
            gate::PERIODIC_HEARTBEATS.patch,
        );
        let writer_task_supported = version.at_least(
            gate::WRITER_ACKS.major,
            gate::WRITER_ACKS.minor,
            gate::WRITER_ACKS.patch,
        );

        self.set_state(if heartbeats_supported {
            ApplierState::Sync
        } else {
            ApplierState::Follow
        });
        self.wait_while_paused().await;

        let (read_half, write_half): (ReadHalf<S>, WriteHalf<S>) = io::split(stream);
        Ok(Subscribed {
            reader: Box::new(NetRowReader { io: read_half }),
            writer: Box::new(NetRowWriter { io: write_half }),
            remote_vclock_at_subscribe,
            heartbeats_supported,
            writer_task_supported,
        })
    }

    /// Called each time a row commits, to evaluate the §4.1 Sync->Follow
    /// gate: still in `Sync`, lag within budget, and the master's
    /// subscribe-time vclock has been caught up to.
    pub fn observe_applied_row(
        &self,
        remote_vclock_at_subscribe: &Vclock,
        local_vclock: &Vclock,
        row_timestamp: f64,
        now: f64,
    ) {
        let lag = Duration::from_secs_f64((now - row_timestamp).max(0.0));
        *self.shared.lag.lock().unwrap() = lag;
        if self.state() == ApplierState::Sync
            && lag <= self.sync_lag
            && remote_vclock_at_subscribe.le(local_vclock)
        {
            self.set_state(ApplierState::Follow);
        }
    }

    pub fn mark_disconnected(&self, e: ReplicationError) -> ReplicationError {
        self.fail(e)
    }
}
