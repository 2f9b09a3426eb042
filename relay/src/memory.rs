//! A trivial in-memory `Storage`/`WalSink`/`CredentialStore` used when no
//! real storage engine is wired in. Storage engine integration is out of
//! scope for this subsystem (§6); this exists only so `relay` is runnable
//! standalone, not as a reference storage engine.

use std::collections::BTreeSet;
use std::sync::Mutex;

use relay_repl::{ApplyError, CredentialStore, Storage, Transaction, Vclock, WalSink};
use relay_wire::Row;

#[derive(Default)]
pub struct InMemoryStorage {
    keys: Mutex<BTreeSet<u64>>,
    durable_vclock: Mutex<Vclock>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of(row: &Row) -> Option<u64> {
        row.decode_body::<u64>().ok()
    }
}

impl Storage for InMemoryStorage {
    fn apply(&self, row: &Row) -> Result<(), ApplyError> {
        if let Some(key) = Self::key_of(row) {
            let mut keys = self.keys.lock().unwrap();
            if !keys.insert(key) {
                return Err(ApplyError::TupleFound);
            }
        }
        Ok(())
    }

    fn apply_initial_join_row(&self, row: &Row) -> Result<(), ApplyError> {
        if let Some(key) = Self::key_of(row) {
            self.keys.lock().unwrap().insert(key);
        }
        Ok(())
    }

    fn durable_vclock(&self) -> Vclock {
        self.durable_vclock.lock().unwrap().clone()
    }
}

impl WalSink for InMemoryStorage {
    fn commit(&self, txn: &Transaction<'_>) -> relay_base::Result<()> {
        self.durable_vclock.lock().unwrap().follow(txn.replica_id, txn.tsn);
        Ok(())
    }
}

pub struct NullCredentialStore;

impl CredentialStore for NullCredentialStore {
    fn auth_reply(&self, salt: &[u8], login: &str, password: &str) -> Vec<u8> {
        let mut reply = salt.to_vec();
        reply.extend_from_slice(login.as_bytes());
        reply.extend_from_slice(password.as_bytes());
        reply
    }
}
