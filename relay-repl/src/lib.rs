//! A replication applier and transaction sequencer for a single
//! in-memory database process: one or more peer connections feeding a
//! single ordered commit stream.
//!
//! The pieces, roughly bottom-up:
//!
//!  - [`vclock`]: the dense replica-id -> lsn map every other module
//!    reasons about.
//!  - [`error`]: the classified error type and the §4.5 reconnect table.
//!  - [`config`]: the configuration schema (defaults only; layering
//!    happens in the `relay` binary).
//!  - [`storage`]: the seam to the storage engine, WAL, and credential
//!    store this crate doesn't implement itself.
//!  - [`notify`]: the state-change notifier used to gate external
//!    actions (e.g. a join-then-subscribe driver) on the applier
//!    reaching a particular state.
//!  - [`applier`]: the per-peer handshake state machine.
//!  - [`sequencer`]: the single per-process worker pool that reads,
//!    orders, and commits transactions from every attached applier.
//!  - [`writer`]: the per-applier ACK sender.
//!  - [`supervisor`]: the reconnect loop tying an applier, its
//!    sequencer attachment, and its writer task together.

pub mod applier;
pub mod config;
pub mod error;
pub mod notify;
pub mod sequencer;
pub mod storage;
pub mod supervisor;
pub mod vclock;
pub mod writer;

pub use applier::{Applier, ApplierState, RowReader, RowWriter, Stream, Subscribed};
pub use config::{Config, PeerConfig, DEFAULT_MAX_WORKERS};
pub use error::{ErrorClass, ReplicationError};
pub use notify::{AwaitError, LastError, Notifier};
pub use sequencer::{ClientHandle, ClientId, Sequencer};
pub use storage::{ApplyError, CredentialStore, Storage, Transaction, WalSink};
pub use supervisor::{run_supervisor, Connector, SupervisorConfig, TcpConnector};
pub use vclock::Vclock;
pub use writer::run_writer_task;
