//! The external collaborator interfaces the core consumes (§6): the
//! on-disk storage engine, WAL writer, and credential store are all out
//! of scope for this subsystem and specified only through the traits it
//! calls against. A real process wires in implementations that talk to
//! the actual storage engine; tests wire in in-memory fakes.

use relay_wire::Row;

use crate::vclock::Vclock;

/// One DML row failed to apply. `TupleFound` is the one outcome the
/// sequencer's conflict-skip policy (§4.2) inspects specifically;
/// everything else aborts the transaction.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("uniqueness conflict")]
    TupleFound,
    #[error("{0}")]
    Other(String),
}

/// A batch of rows belonging to one transaction, ready to commit. All
/// rows share `replica_id` and `tsn`; `tsn == rows[0].lsn`.
pub struct Transaction<'a> {
    pub replica_id: relay_wire::ReplicaId,
    pub tsn: relay_wire::Lsn,
    pub rows: &'a [Row],
}

/// The row-application seam. Bulk-load during `InitialJoin` bypasses
/// secondary index maintenance, which is why it's a distinct method
/// rather than a flag on `apply`.
pub trait Storage: Send + Sync {
    fn apply(&self, row: &Row) -> Result<(), ApplyError>;
    fn apply_initial_join_row(&self, row: &Row) -> Result<(), ApplyError>;

    /// Read-only snapshot of the durable vclock, consulted at subscribe
    /// time and whenever the sequencer reseeds after draining a poison.
    fn durable_vclock(&self) -> Vclock;

    /// True if the process has any pending local (non-replicated) side
    /// effect on the current transaction context -- the distributed
    /// transaction guard in §4.2 refuses to replicate a transaction that
    /// mixes one of these in with remote rows.
    fn has_local_side_effect(&self) -> bool {
        false
    }
}

/// Durably commits a prepared batch of applied rows. The sequencer calls
/// this once per transaction, after every row in it has been applied
/// successfully.
pub trait WalSink: Send + Sync {
    fn commit(&self, txn: &Transaction<'_>) -> relay_base::Result<()>;
}

/// The credential store and authentication challenge protocol (out of
/// scope: produces an auth reply given a salt, login, and password).
pub trait CredentialStore: Send + Sync {
    fn auth_reply(&self, salt: &[u8], login: &str, password: &str) -> Vec<u8>;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::*;

    /// An in-memory `Storage` + `WalSink` used by the sequencer and
    /// applier tests. Tracks applied primary keys (taken from a row's
    /// decoded body, a plain `u64`) so uniqueness conflicts can be
    /// injected deterministically.
    #[derive(Default)]
    pub struct FakeStorage {
        keys: Mutex<BTreeSet<u64>>,
        conflict_keys: Mutex<BTreeSet<u64>>,
        durable_vclock: Mutex<Vclock>,
        pub commits: Mutex<Vec<(relay_wire::ReplicaId, relay_wire::Lsn)>>,
    }

    impl FakeStorage {
        pub fn new() -> Self {
            Self::default()
        }

        /// Any future `apply` of a row carrying this key fails with
        /// `TupleFound` until the key is cleared.
        pub fn poison_key(&self, key: u64) {
            self.conflict_keys.lock().unwrap().insert(key);
        }

        pub fn seed_durable_vclock(&self, vclock: Vclock) {
            *self.durable_vclock.lock().unwrap() = vclock;
        }

        pub fn contains_key(&self, key: u64) -> bool {
            self.keys.lock().unwrap().contains(&key)
        }

        fn key_of(row: &Row) -> Option<u64> {
            row.decode_body::<u64>().ok()
        }
    }

    impl Storage for FakeStorage {
        fn apply(&self, row: &Row) -> Result<(), ApplyError> {
            if let Some(key) = Self::key_of(row) {
                if self.conflict_keys.lock().unwrap().contains(&key) {
                    return Err(ApplyError::TupleFound);
                }
                self.keys.lock().unwrap().insert(key);
            }
            Ok(())
        }

        fn apply_initial_join_row(&self, row: &Row) -> Result<(), ApplyError> {
            self.apply(row)
        }

        fn durable_vclock(&self) -> Vclock {
            self.durable_vclock.lock().unwrap().clone()
        }
    }

    impl WalSink for FakeStorage {
        fn commit(&self, txn: &Transaction<'_>) -> relay_base::Result<()> {
            self.commits
                .lock()
                .unwrap()
                .push((txn.replica_id, txn.tsn));
            Ok(())
        }
    }

    pub struct FakeCredentialStore;

    impl CredentialStore for FakeCredentialStore {
        fn auth_reply(&self, salt: &[u8], login: &str, _password: &str) -> Vec<u8> {
            let mut reply = salt.to_vec();
            reply.extend_from_slice(login.as_bytes());
            reply
        }
    }
}
