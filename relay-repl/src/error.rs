//! Classified replication errors and the applier reconnect table (see
//! SPEC_FULL.md §4.5 and §7).
//!
//! The wire layer only knows `relay_wire::payload::ErrorCode` -- an
//! errcode-and-message pair decoded off an `Error` row. This module is
//! where that gets turned into something the supervisor can `match` on
//! without re-deriving the table every time it classifies a failure.

use thiserror::Error;
use uuid::Uuid;

use relay_wire::payload::ErrorCode;

/// Where the supervisor sends the applier after a classified error
/// (§4.5). `Disconnected` and `Loading` both retry after
/// `replication_reconnect_interval`; the difference is only diagnostic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Off,
    Disconnected,
    Loading,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("connected to self: peer uuid matches local instance uuid")]
    ConnectionToSelf,

    #[error("replicaset uuid mismatch: expected {expected}, peer reports {actual}")]
    ReplicasetUuidMismatch { expected: Uuid, actual: Uuid },

    #[error("peer is loading: {0}")]
    Loading(String),

    #[error("configuration refused by peer: {0}")]
    Cfg(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("no such user: {0}")]
    NoSuchUser(String),

    #[error("remote system error: {0}")]
    RemoteSystem(String),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer doesn't recognize a request type we sent it -- distinct
    /// from `Protocol` so callers that tolerate this one specific errcode
    /// (§4.1's `Vote`) don't end up tolerating every protocol violation.
    #[error("unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("uniqueness conflict")]
    TupleFound,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("transaction conflict")]
    TransactionConflict,

    #[error("timed out waiting for applier state")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("wire codec failure: {0}")]
    Wire(String),
}

impl ReplicationError {
    /// Build the variant that corresponds to an `ErrorCode` decoded off a
    /// peer's `Error` row. Codes this crate doesn't special-case fall
    /// under the `_ => Stopped` row of the classification table.
    pub fn from_wire(code: ErrorCode, message: String) -> ReplicationError {
        match code {
            ErrorCode::Loading => ReplicationError::Loading(message),
            ErrorCode::Cfg => ReplicationError::Cfg(message),
            ErrorCode::AccessDenied => ReplicationError::AccessDenied(message),
            ErrorCode::NoSuchUser => ReplicationError::NoSuchUser(message),
            ErrorCode::System => ReplicationError::RemoteSystem(message),
            ErrorCode::ConnectionToSelf => ReplicationError::ConnectionToSelf,
            ErrorCode::TupleFound => ReplicationError::TupleFound,
            ErrorCode::Unsupported => ReplicationError::Unsupported(message),
            ErrorCode::TransactionConflict => ReplicationError::TransactionConflict,
            ErrorCode::UnknownRequestType => ReplicationError::UnknownRequestType(message),
            ErrorCode::Protocol | ErrorCode::Other(_) => ReplicationError::Protocol(message),
            // ReplicasetUuidMismatch is raised locally (we're the one
            // comparing uuids), never decoded directly off an error row.
            ErrorCode::ReplicasetUuidMismatch => ReplicationError::Protocol(message),
        }
    }

    /// The §4.5 classification table, minus the "cancellation" row: task
    /// cancellation is handled separately by the supervisor, since it
    /// isn't observed as a `ReplicationError` at all.
    pub fn classify(&self) -> ErrorClass {
        use ReplicationError::*;
        match self {
            ConnectionToSelf => ErrorClass::Off,
            Cancelled => ErrorClass::Off,
            Loading(_) | Cfg(_) | AccessDenied(_) | NoSuchUser(_) => ErrorClass::Loading,
            RemoteSystem(_) | Socket(_) => ErrorClass::Disconnected,
            ReplicasetUuidMismatch { .. }
            | Protocol(_)
            | UnknownRequestType(_)
            | TupleFound
            | Unsupported(_)
            | TransactionConflict
            | Timeout
            | OutOfMemory(_)
            | Wire(_) => ErrorClass::Stopped,
        }
    }
}

impl From<relay_base::Error> for ReplicationError {
    fn from(e: relay_base::Error) -> Self {
        ReplicationError::Wire(e.to_string())
    }
}

/// Unlike the generic `relay_base::Error` conversion above (used for
/// storage/WAL failures, which carry no transport semantics), this keeps
/// genuine transport failures classifiable as `Disconnected`: a dropped
/// connection must send the applier back through the reconnect loop
/// (§4.5/§7), not straight to `Stopped`.
impl From<relay_wire::WireError> for ReplicationError {
    fn from(e: relay_wire::WireError) -> Self {
        use relay_wire::WireError;
        let message = e.to_string();
        match e {
            WireError::Io(io_err) => ReplicationError::Socket(io_err),
            WireError::Timeout => {
                ReplicationError::Socket(std::io::Error::new(std::io::ErrorKind::TimedOut, message))
            }
            WireError::FrameTooLarge { .. }
            | WireError::EncodeTooLarge { .. }
            | WireError::MissingBody
            | WireError::Encode(_)
            | WireError::Decode(_) => ReplicationError::Wire(message),
        }
    }
}
