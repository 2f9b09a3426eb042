//! Row codec adapter.
//!
//! This is the wire framing and message set the replication core consumes:
//! a `Greeting` exchanged once per connection, and a stream of `Row` frames
//! (requests, responses, and DML) all sharing one on-the-wire shape. Frames
//! are length-prefixed and `rmp-serde`-encoded, the same choice the project
//! already makes for inter-node messaging elsewhere in the tree.
//!
//! Everything here is deliberately dumb about what a DML body *means* --
//! that's the storage engine's business (see `relay_repl::storage`). This
//! crate only knows how to get bytes on and off the wire and how to speak
//! the handful of control messages (`Vote`, `Auth`, `Join`, `Subscribe`)
//! needed to drive the applier state machine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Failures from framing and decoding a row off (or onto) the wire.
///
/// Kept as its own type, with a first-class [`WireError::Io`] variant,
/// rather than collapsing everything through `relay_base::Error`: callers
/// upstream (the applier's reconnect classification, §4.5/§7) need to tell
/// a transport failure -- connection reset, broken pipe, EOF -- apart from
/// a codec or framing failure, and a generic error type erases exactly that
/// distinction.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for a row")]
    Timeout,
    #[error("frame exceeds maximum length ({len} > {max})")]
    FrameTooLarge { len: u32, max: u32 },
    #[error("frame too large to encode ({len} bytes)")]
    EncodeTooLarge { len: usize },
    #[error("expected a row body but found none")]
    MissingBody,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Replica identifiers are small positive integers; 0 is reserved to mean
/// "no replica assigned yet".
pub type ReplicaId = u8;

/// Replica ids must lie in `[1, N_MAX)`.
pub const N_MAX: ReplicaId = 32;

pub type Lsn = i64;

/// A dense replica-id -> lsn map, as exchanged on the wire during JOIN and
/// SUBSCRIBE. The richer `relay_repl::Vclock` type wraps this with the
/// monotonicity invariants; this is just its wire shape.
pub type WireVclock = BTreeMap<ReplicaId, Lsn>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        ProtocolVersion { major, minor, patch }
    }

    /// True if `self >= (major, minor, patch)`.
    pub fn at_least(&self, major: u8, minor: u8, patch: u8) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }
}

/// Version gates named after the behavior they unlock (see SPEC_FULL §6).
pub mod gate {
    use super::ProtocolVersion;

    pub const SUBSCRIBE_RESPONSE_BODY: ProtocolVersion = ProtocolVersion::new(1, 6, 7);
    pub const JOIN_START_VCLOCK: ProtocolVersion = ProtocolVersion::new(1, 7, 0);
    pub const WRITER_ACKS: ProtocolVersion = ProtocolVersion::new(1, 7, 4);
    pub const PERIODIC_HEARTBEATS: ProtocolVersion = ProtocolVersion::new(1, 7, 7);
}

/// The greeting exchanged once, immediately after connecting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Greeting {
    pub protocol: String,
    pub peer_uuid: Uuid,
    pub version: ProtocolVersionWire,
    pub salt: Vec<u8>,
}

/// `ProtocolVersion` has no `Serialize` impl of its own so that application
/// code can't accidentally send it as a bare tuple; this is its wire twin.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ProtocolVersionWire(pub u8, pub u8, pub u8);

impl From<ProtocolVersionWire> for ProtocolVersion {
    fn from(w: ProtocolVersionWire) -> Self {
        ProtocolVersion::new(w.0, w.1, w.2)
    }
}

impl From<ProtocolVersion> for ProtocolVersionWire {
    fn from(v: ProtocolVersion) -> Self {
        ProtocolVersionWire(v.major, v.minor, v.patch)
    }
}

impl Greeting {
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version.into()
    }
}

/// The master's ballot, as returned by `Vote`. Only the fields the applier
/// actually inspects are modeled; everything else about leader election is
/// out of scope.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Ballot {
    pub is_loading: bool,
    pub is_anon: bool,
}

/// A row, in the sense of §3: the single shape shared by DML/NOP frames and
/// by every request/response control message. `row_type` tells the reader
/// how to interpret `body`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Row {
    pub replica_id: ReplicaId,
    pub lsn: Lsn,
    pub tsn: Lsn,
    pub is_commit: bool,
    pub row_type: RowType,
    pub timestamp: f64,
    pub body: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RowType {
    Dml,
    Nop,
    Ok,
    Vote,
    Auth,
    Join,
    Subscribe,
    Error,
}

impl Row {
    /// A bare control frame with no body and no transaction identity; used
    /// for requests that aren't part of a replicated transaction.
    pub fn control(row_type: RowType) -> Self {
        Row {
            replica_id: 0,
            lsn: 0,
            tsn: 0,
            is_commit: false,
            row_type,
            timestamp: 0.0,
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Serialize) -> Result<Self> {
        self.body = Some(rmp_serde::to_vec(&body)?);
        Ok(self)
    }

    pub fn decode_body<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        let body = self.body.as_ref().ok_or(WireError::MissingBody)?;
        Ok(rmp_serde::from_slice(body)?)
    }

    pub fn is_dml(&self) -> bool {
        matches!(self.row_type, RowType::Dml | RowType::Nop)
    }

    /// Turn a DML row into its NOP replacement in place, per the uniqueness
    /// conflict skip policy: same lsn/tsn/replica_id, no body.
    pub fn into_nop(mut self) -> Self {
        self.row_type = RowType::Nop;
        self.body = None;
        self
    }
}

/// Structured payloads carried in `Row::body` for each control message.
pub mod payload {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AuthRequest {
        pub login: String,
        pub scramble: Vec<u8>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct JoinRequest {
        pub instance_uuid: Uuid,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct SubscribeRequest {
        pub cluster_uuid: Uuid,
        pub instance_uuid: Uuid,
        pub vclock: WireVclock,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct OkBody {
        pub vclock: Option<WireVclock>,
        pub cluster_uuid: Option<Uuid>,
        pub ballot: Option<Ballot>,
        /// The replica id assigned by the peer. Modern peers (>= 1.7.0)
        /// assign this during the separate final-join stream; legacy peers
        /// merge final-join into `Subscribe` and carry it here instead
        /// (§4.1).
        pub replica_id: Option<ReplicaId>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct ErrorBody {
        pub code: ErrorCode,
        pub message: String,
    }

    /// Errcodes the core needs to distinguish in the §4.5 classification
    /// table. `Other` preserves anything this crate doesn't special-case.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
    pub enum ErrorCode {
        Loading,
        Cfg,
        AccessDenied,
        NoSuchUser,
        System,
        UnknownRequestType,
        ConnectionToSelf,
        ReplicasetUuidMismatch,
        Protocol,
        TupleFound,
        Unsupported,
        TransactionConflict,
        Other(u32),
    }
}

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Read one length-prefixed, `rmp-serde`-encoded greeting frame.
pub async fn read_greeting<T: AsyncRead + Unpin>(io: &mut T) -> Result<Greeting> {
    read_framed(io).await
}

pub async fn write_greeting<T: AsyncWrite + Unpin>(io: &mut T, greeting: &Greeting) -> Result<()> {
    write_framed(io, greeting).await
}

pub async fn read_row<T: AsyncRead + Unpin>(io: &mut T) -> Result<Row> {
    read_framed(io).await
}

pub async fn read_row_timeout<T: AsyncRead + Unpin>(
    io: &mut T,
    timeout: Duration,
) -> Result<Row> {
    match tokio::time::timeout(timeout, read_row(io)).await {
        Ok(result) => result,
        Err(_) => Err(WireError::Timeout),
    }
}

pub async fn write_row<T: AsyncWrite + Unpin>(io: &mut T, row: &Row) -> Result<()> {
    write_framed(io, row).await
}

async fn read_framed<T, M>(io: &mut T) -> Result<M>
where
    T: AsyncRead + Unpin,
    M: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        tracing::debug!(len, max = MAX_FRAME_LEN, "rejecting oversized frame");
        return Err(WireError::FrameTooLarge { len, max: MAX_FRAME_LEN });
    }
    let mut buf = vec![0u8; len as usize];
    io.read_exact(&mut buf).await?;
    rmp_serde::from_slice(&buf).map_err(|e| {
        tracing::debug!(len, error = %e, "failed to decode frame body");
        WireError::from(e)
    })
}

async fn write_framed<T, M>(io: &mut T, msg: &M) -> Result<()>
where
    T: AsyncWrite + Unpin,
    M: Serialize,
{
    let buf = rmp_serde::to_vec(msg)?;
    let len = u32::try_from(buf.len()).map_err(|_| WireError::EncodeTooLarge { len: buf.len() })?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test;
