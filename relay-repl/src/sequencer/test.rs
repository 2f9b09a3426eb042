use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use relay_wire::{Lsn, ReplicaId, Row, RowType};

use super::Sequencer;
use crate::applier::{Applier, RowReader};
use crate::config::PeerConfig;
use crate::error::{ErrorClass, ReplicationError};
use crate::storage::fake::FakeStorage;
use crate::vclock::Vclock;

#[cfg(test)]
use test_log::test;

fn dml_row(replica_id: ReplicaId, lsn: Lsn, key: u64) -> Row {
    let mut row = Row::control(RowType::Dml).with_body(key).unwrap();
    row.replica_id = replica_id;
    row.lsn = lsn;
    row.tsn = lsn;
    row.is_commit = true;
    row.timestamp = lsn as f64;
    row
}

fn test_applier(label: &str) -> Applier {
    Applier::new(&PeerConfig::new(label), Uuid::new_v4(), Duration::from_secs(1), Duration::from_millis(10))
}

struct ScriptedReader {
    rows: VecDeque<Row>,
}

impl RowReader for ScriptedReader {
    fn read_row<'a>(
        &'a mut self,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Row, ReplicationError>> + Send + 'a>> {
        Box::pin(async move {
            self.rows.pop_front().ok_or_else(|| {
                ReplicationError::Socket(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "script exhausted"))
            })
        })
    }
}

/// A reader that never resolves, standing in for a client that stays
/// attached (but idle) for the duration of a test.
#[derive(Default)]
struct BlockingReader {
    notify: Notify,
}

impl RowReader for BlockingReader {
    fn read_row<'a>(
        &'a mut self,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Row, ReplicationError>> + Send + 'a>> {
        Box::pin(async move {
            self.notify.notified().await;
            unreachable!("test never wakes this reader")
        })
    }
}

#[tokio::test]
async fn commits_single_transaction_and_advances_vclocks() {
    let storage = Arc::new(FakeStorage::new());
    let sequencer = Sequencer::new(storage.clone(), storage.clone(), 4, false);
    let reader: Box<dyn RowReader> = Box::new(ScriptedReader { rows: VecDeque::from(vec![dml_row(1, 1, 42)]) });
    let handle = sequencer.attach(test_applier("peer-a"), reader, Vclock::new(), Duration::from_millis(50));

    handle.wait_done().await;

    assert_eq!(storage.commits.lock().unwrap().as_slice(), &[(1, 1)]);
    assert!(storage.contains_key(42));
    assert_eq!(sequencer.tx_vclock().get(1), 1);
    assert!(!sequencer.is_poisoned(), "a lone read failure must not poison the sequencer");
}

#[tokio::test]
async fn duplicate_frame_is_discarded_and_reading_continues() {
    let storage = Arc::new(FakeStorage::new());
    let sequencer = Sequencer::new(storage.clone(), storage.clone(), 4, false);
    let reader: Box<dyn RowReader> = Box::new(ScriptedReader {
        rows: VecDeque::from(vec![dml_row(1, 5, 1), dml_row(1, 5, 1), dml_row(1, 6, 2)]),
    });
    let handle = sequencer.attach(test_applier("peer-b"), reader, Vclock::new(), Duration::from_millis(50));

    handle.wait_done().await;

    assert_eq!(storage.commits.lock().unwrap().as_slice(), &[(1, 5), (1, 6)]);
    assert_eq!(sequencer.net_vclock().get(1), 6);
}

#[tokio::test]
async fn conflict_is_skipped_as_a_nop_when_configured() {
    let storage = Arc::new(FakeStorage::new());
    storage.poison_key(99);
    let sequencer = Sequencer::new(storage.clone(), storage.clone(), 4, true);
    let reader: Box<dyn RowReader> = Box::new(ScriptedReader { rows: VecDeque::from(vec![dml_row(1, 1, 99)]) });
    let handle = sequencer.attach(test_applier("peer-c"), reader, Vclock::new(), Duration::from_millis(50));

    handle.wait_done().await;

    assert!(!sequencer.is_poisoned());
    assert!(!storage.contains_key(99), "the conflicting row must not have been applied");
    assert_eq!(storage.commits.lock().unwrap().as_slice(), &[(1, 1)], "the NOP still commits in the transaction's slot");
}

#[tokio::test]
async fn apply_conflict_without_skip_poisons_and_cancels_stage_one_readers() {
    let storage = Arc::new(FakeStorage::new());
    storage.poison_key(7);
    let sequencer = Sequencer::new(storage.clone(), storage.clone(), 4, false);

    // This client never sends anything more; it just sits in stage 1.
    // Poisoning must cut it loose rather than hold the sequencer poisoned
    // until it happens to send more bytes (§4.2 Abort semantics).
    let blocking_reader: Box<dyn RowReader> = Box::new(BlockingReader::default());
    let blocking_handle = sequencer.attach(test_applier("peer-blocker"), blocking_reader, Vclock::new(), Duration::from_secs(10));

    let reader: Box<dyn RowReader> = Box::new(ScriptedReader { rows: VecDeque::from(vec![dml_row(1, 1, 7)]) });
    let handle = sequencer.attach(test_applier("peer-d"), reader, Vclock::new(), Duration::from_millis(50));

    handle.wait_done().await;
    blocking_handle.wait_done().await;

    assert_eq!(handle.diagnostic().map(|e| e.class), Some(ErrorClass::Stopped));
    assert_eq!(
        blocking_handle.diagnostic().map(|e| e.class),
        Some(ErrorClass::Stopped),
        "poisoning must cancel stage-1 readers still blocked on the network, not just the client that triggered it"
    );
    assert!(!sequencer.is_poisoned(), "once every attached client has drained, the sequencer clears its diagnostic");
}
