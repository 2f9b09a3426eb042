//! The sequencer (§4.2, §3): the single per-process scheduler that pulls
//! transactions off every subscribed client's connection, orders them,
//! and commits them into local storage.
//!
//! A client is represented twice while it's attached. `ClientConn` owns
//! the actual `RowReader` and moves by value between the idle queue and
//! whichever worker currently has it checked out -- the compiler enforces
//! the "exactly one worker touches a connection at a time" invariant, no
//! extra lock needed. `ClientHandle` is the cheaply-cloned, `Arc`-backed
//! half that survives independently of the reader: a worker hands the
//! `ClientConn` back to the idle queue the moment it has read a whole
//! transaction off the wire, then continues the second (apply) stage
//! holding only the `ClientHandle`, which is how two stages of the same
//! replica's pipeline run concurrently on different workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use relay_wire::{Lsn, ReplicaId, Row, N_MAX};

use crate::applier::{Applier, RowReader};
use crate::error::ErrorClass;
use crate::notify::LastError;
use crate::storage::{ApplyError, Storage, Transaction, WalSink};
use crate::vclock::Vclock;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClientId(u64);

fn next_client_id() -> ClientId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    ClientId(NEXT.fetch_add(1, Ordering::Relaxed))
}

struct ClientHandleInner {
    id: ClientId,
    applier: Applier,
    remote_vclock_at_subscribe: Vclock,
    read_timeout: Duration,
    writer_notify: Notify,
    done: AtomicBool,
    done_notify: Notify,
    diag: Mutex<Option<LastError>>,
    /// Guards `detach_client` against running more than once for the same
    /// client: stage 1 and every pipelined apply-stage task for the same
    /// replica can independently observe a poison and call `detach_client`
    /// concurrently (§4.2 abort semantics). Only the task that wins the
    /// compare-exchange actually decrements `attached` or marks the client
    /// done.
    detached: AtomicBool,
}

/// The `Arc`-shared half of an attached client, kept by the worker
/// running its apply stage after the reader has already gone back to
/// the idle queue, and by the writer task for the lifetime of the
/// connection.
#[derive(Clone)]
pub struct ClientHandle(Arc<ClientHandleInner>);

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.0.id
    }

    pub fn applier(&self) -> &Applier {
        &self.0.applier
    }

    /// Blocks the caller (the writer task) until the sequencer has
    /// committed a transaction since the last wake, or the connection is
    /// done.
    pub async fn writer_notified(&self) {
        self.0.writer_notify.notified().await;
    }

    fn wake_writer(&self) {
        self.0.writer_notify.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.0.done.load(Ordering::Acquire)
    }

    pub fn diagnostic(&self) -> Option<LastError> {
        self.0.diag.lock().unwrap().clone()
    }

    /// Claims the right to detach this client, returning `true` at most
    /// once across every concurrent caller. Stage 1 and any number of
    /// pipelined apply-stage tasks may all try to detach the same client
    /// after a poison; only the winner should run `mark_done` or touch the
    /// sequencer's `attached` count (invariant 4: `done` delivered exactly
    /// once).
    fn claim_detach(&self) -> bool {
        self.0
            .detached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_done(&self, err: Option<LastError>) {
        *self.0.diag.lock().unwrap() = err;
        self.0.done.store(true, Ordering::Release);
        self.0.done_notify.notify_waiters();
        self.wake_writer();
    }

    /// Awaited by the supervisor: resolves once this connection has been
    /// detached, whether cleanly (shutdown) or with an error.
    pub async fn wait_done(&self) {
        loop {
            if self.is_done() {
                return;
            }
            self.0.done_notify.notified().await;
        }
    }
}

/// The half of an attached client that moves between the idle queue and
/// a worker; never shared, never locked.
struct ClientConn {
    handle: ClientHandle,
    reader: Box<dyn RowReader>,
}

struct SequencerInner {
    max_workers: usize,
    net_vclock: Mutex<Vclock>,
    tx_vclock: Mutex<Vclock>,
    tx_vclock_notify: Notify,
    idle: Mutex<VecDeque<ClientConn>>,
    idle_notify: Notify,
    poison_notify: Notify,
    diag: Mutex<Option<LastError>>,
    attached: AtomicUsize,
    worker_count: AtomicUsize,
    idle_worker_count: AtomicUsize,
    storage: Arc<dyn Storage>,
    wal: Arc<dyn WalSink>,
    skip_conflict: AtomicBool,
    shutting_down: AtomicBool,
}

/// The single scheduler instance a process runs (§3). Cheap to clone;
/// every supervisor and writer task holds one.
#[derive(Clone)]
pub struct Sequencer(Arc<SequencerInner>);

impl Sequencer {
    pub fn new(storage: Arc<dyn Storage>, wal: Arc<dyn WalSink>, max_workers: usize, skip_conflict: bool) -> Self {
        let durable = storage.durable_vclock();
        let inner = Arc::new(SequencerInner {
            max_workers,
            net_vclock: Mutex::new(durable.clone()),
            tx_vclock: Mutex::new(durable),
            tx_vclock_notify: Notify::new(),
            idle: Mutex::new(VecDeque::new()),
            idle_notify: Notify::new(),
            poison_notify: Notify::new(),
            diag: Mutex::new(None),
            attached: AtomicUsize::new(0),
            worker_count: AtomicUsize::new(0),
            idle_worker_count: AtomicUsize::new(0),
            storage,
            wal,
            skip_conflict: AtomicBool::new(skip_conflict),
            shutting_down: AtomicBool::new(false),
        });
        tokio::spawn(scheduler_loop(inner.clone()));
        Sequencer(inner)
    }

    pub fn net_vclock(&self) -> Vclock {
        self.0.net_vclock.lock().unwrap().clone()
    }

    pub fn tx_vclock(&self) -> Vclock {
        self.0.tx_vclock.lock().unwrap().clone()
    }

    pub fn is_poisoned(&self) -> bool {
        self.0.diag.lock().unwrap().is_some()
    }

    pub fn diagnostic(&self) -> Option<LastError> {
        self.0.diag.lock().unwrap().clone()
    }

    pub fn set_skip_conflict(&self, skip: bool) {
        self.0.skip_conflict.store(skip, Ordering::Relaxed);
    }

    /// Attach a freshly subscribed client (§4.1 hands this off right
    /// after `Subscribe` completes). Returns the handle the supervisor
    /// and writer task use to observe the connection's lifetime.
    pub fn attach(
        &self,
        applier: Applier,
        reader: Box<dyn RowReader>,
        remote_vclock_at_subscribe: Vclock,
        read_timeout: Duration,
    ) -> ClientHandle {
        let handle = ClientHandle(Arc::new(ClientHandleInner {
            id: next_client_id(),
            applier,
            remote_vclock_at_subscribe,
            read_timeout,
            writer_notify: Notify::new(),
            done: AtomicBool::new(false),
            done_notify: Notify::new(),
            diag: Mutex::new(None),
            detached: AtomicBool::new(false),
        }));
        self.0.attached.fetch_add(1, Ordering::SeqCst);
        self.0
            .idle
            .lock()
            .unwrap()
            .push_back(ClientConn { handle: handle.clone(), reader });
        self.0.idle_notify.notify_waiters();
        handle
    }

    pub fn shutdown(&self) {
        self.0.shutting_down.store(true, Ordering::SeqCst);
        self.0.idle_notify.notify_waiters();
        self.0.poison_notify.notify_waiters();
        self.0.tx_vclock_notify.notify_waiters();
    }

    /// Seed both vclocks from the master's join-response start vclock
    /// (§4.1): on peers new enough to send one, this runs before any
    /// `InitialJoin` row is processed, mirroring the original's bootstrap
    /// path of copying the checkpoint's vclock before loading it.
    pub fn seed_vclock(&self, vclock: &Vclock) {
        *self.0.net_vclock.lock().unwrap() = vclock.clone();
        *self.0.tx_vclock.lock().unwrap() = vclock.clone();
    }

    /// Bulk-load one row during `InitialJoin` (§4.1). This is loading the
    /// master's checkpoint, not replicating a write: no vclock advances
    /// and nothing is written to the local WAL, matching
    /// `apply_initial_join_row`'s bypass of secondary index maintenance
    /// in the original.
    pub fn apply_initial_join_row(&self, row: &Row) -> Result<(), ApplyError> {
        self.0.storage.apply_initial_join_row(row)
    }

    /// Apply and commit one row during `FinalJoin` (§4.1). Unlike the
    /// normal two-stage pipeline, each final-join row is its own
    /// transaction applied and committed in turn as it arrives -- there
    /// is only the one applier connection involved, so there is nothing
    /// to pipeline against -- and both vclocks advance immediately so the
    /// `Subscribe` request that follows already reflects it.
    pub fn apply_final_join_row(&self, row: &Row) -> relay_base::Result<()> {
        self.0.storage.apply(row).map_err(relay_base::Error::from)?;
        let txn = Transaction { replica_id: row.replica_id, tsn: row.tsn, rows: std::slice::from_ref(row) };
        self.0.wal.commit(&txn)?;
        self.0.net_vclock.lock().unwrap().follow(row.replica_id, row.lsn);
        self.0.tx_vclock.lock().unwrap().follow(row.replica_id, row.lsn);
        self.0.tx_vclock_notify.notify_waiters();
        Ok(())
    }
}

async fn scheduler_loop(inner: Arc<SequencerInner>) {
    loop {
        if inner.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let need_worker = {
            let idle_len = inner.idle.lock().unwrap().len();
            idle_len > 0 && inner.idle_worker_count.load(Ordering::Relaxed) == 0
        };
        if need_worker && inner.worker_count.load(Ordering::Relaxed) < inner.max_workers {
            tokio::spawn(worker_loop(inner.clone()));
        }
        inner.idle_notify.notified().await;
    }
}

async fn worker_loop(inner: Arc<SequencerInner>) {
    inner.worker_count.fetch_add(1, Ordering::Relaxed);
    loop {
        inner.idle_worker_count.fetch_add(1, Ordering::Relaxed);
        let conn = wait_and_pop_idle(&inner).await;
        inner.idle_worker_count.fetch_sub(1, Ordering::Relaxed);
        match conn {
            Some(conn) => process_client(&inner, conn).await,
            None => break,
        }
    }
    inner.worker_count.fetch_sub(1, Ordering::Relaxed);
}

async fn wait_and_pop_idle(inner: &Arc<SequencerInner>) -> Option<ClientConn> {
    loop {
        if inner.shutting_down.load(Ordering::Relaxed) {
            return None;
        }
        if let Some(conn) = inner.idle.lock().unwrap().pop_front() {
            return Some(conn);
        }
        inner.idle_notify.notified().await;
    }
}

/// What stage 1 produced for one client: a whole transaction, a read
/// failure, or a cancellation because the sequencer poisoned while the
/// read was in flight.
enum ReadOutcome {
    Tx(PulledTx),
    Err(LastError),
    Poisoned,
}

/// Races `read_one_transaction` against `poison_notify` so a client stuck
/// in stage 1 -- blocked on the network, possibly forever -- is cut loose
/// the moment the sequencer poisons, instead of holding the poison open
/// until it happens to send more bytes (§4.2 Abort semantics).
///
/// The `notified()` future is created before the `diag` check so a
/// `poison()` call landing between the check and the `select!` still
/// wakes this task rather than being missed.
async fn read_one_transaction_or_poison(
    inner: &Arc<SequencerInner>,
    reader: &mut dyn RowReader,
    timeout: Duration,
) -> ReadOutcome {
    let notified = inner.poison_notify.notified();
    tokio::pin!(notified);
    if inner.diag.lock().unwrap().is_some() {
        return ReadOutcome::Poisoned;
    }
    tokio::select! {
        biased;
        _ = &mut notified => ReadOutcome::Poisoned,
        result = read_one_transaction(reader, timeout) => match result {
            Ok(tx) => ReadOutcome::Tx(tx),
            Err(e) => ReadOutcome::Err(e),
        },
    }
}

/// One pulled but not-yet-ordered transaction: every row shares
/// `replica_id` and `tsn`, and `tsn == rows[0].lsn`.
struct PulledTx {
    replica_id: ReplicaId,
    lsn: Lsn,
    rows: Vec<Row>,
}

fn protocol_err(message: impl Into<String>) -> LastError {
    LastError { class: ErrorClass::Stopped, message: message.into() }
}

async fn read_one_transaction(reader: &mut dyn RowReader, timeout: Duration) -> Result<PulledTx, LastError> {
    let first = reader
        .read_row(timeout)
        .await
        .map_err(|e| LastError::from(&e))?;
    if first.replica_id == 0 || first.replica_id >= N_MAX {
        return Err(protocol_err(format!("replica id {} out of range", first.replica_id)));
    }
    if first.tsn != first.lsn {
        return Err(protocol_err(format!(
            "first row of a transaction must have tsn == lsn, got tsn {} lsn {}",
            first.tsn, first.lsn
        )));
    }
    let replica_id = first.replica_id;
    let tsn = first.tsn;
    let lsn = first.lsn;
    let mut committed = first.is_commit;
    let mut rows = vec![first];
    while !committed {
        let row = reader
            .read_row(timeout)
            .await
            .map_err(|e| LastError::from(&e))?;
        if row.replica_id != replica_id || row.tsn != tsn {
            return Err(protocol_err("interleaved rows from another transaction"));
        }
        committed = row.is_commit;
        rows.push(row);
    }
    Ok(PulledTx { replica_id, lsn, rows })
}

/// Stage 1 + handoff: read a whole transaction off `conn`'s reader,
/// reject it as a duplicate if its lsn has already been seen, put the
/// connection back in the idle queue, then run stage 2 (apply + commit)
/// holding only the handle.
async fn process_client(inner: &Arc<SequencerInner>, mut conn: ClientConn) {
    loop {
        match read_one_transaction_or_poison(inner, &mut *conn.reader, conn.handle.0.read_timeout).await {
            ReadOutcome::Tx(tx) => {
                let prev_lsn = {
                    let mut net = inner.net_vclock.lock().unwrap();
                    if tx.lsn <= net.get(tx.replica_id) {
                        None
                    } else {
                        Some(net.follow(tx.replica_id, tx.lsn))
                    }
                };
                let prev_lsn = match prev_lsn {
                    // Duplicate frame: discard and keep reading from the
                    // same connection (§4.2, invariant 4).
                    None => continue,
                    Some(prev) => prev,
                };
                let handle = conn.handle.clone();
                inner.idle.lock().unwrap().push_back(ClientConn { handle: handle.clone(), reader: conn.reader });
                inner.idle_notify.notify_waiters();
                apply_and_commit(inner, &handle, tx, prev_lsn).await;
                return;
            }
            ReadOutcome::Err(e) => {
                detach_client(inner, &conn.handle, Some(e));
                return;
            }
            ReadOutcome::Poisoned => {
                let diag = inner.diag.lock().unwrap().clone();
                detach_client(inner, &conn.handle, diag);
                return;
            }
        }
    }
}

fn poison(inner: &Arc<SequencerInner>, err: LastError) -> LastError {
    let mut diag = inner.diag.lock().unwrap();
    if diag.is_none() {
        *diag = Some(err);
        drop(diag);
        inner.poison_notify.notify_waiters();
        inner.diag.lock().unwrap().clone().unwrap()
    } else {
        diag.clone().unwrap()
    }
}

/// Detaches `handle` from the sequencer, exactly once no matter how many
/// concurrent callers race to detach the same client (§4.2 abort
/// semantics: a poison can wake stage 1 and every pipelined apply-stage
/// task for the same replica at once). Callers that lose the race still
/// observe the client as done via `mark_done`'s side effects, but must not
/// double-decrement `attached` -- that would fire `drain_if_empty` while
/// other clients are still attached, or underflow and never fire it.
fn detach_client(inner: &Arc<SequencerInner>, handle: &ClientHandle, err: Option<LastError>) {
    if !handle.claim_detach() {
        return;
    }
    handle.mark_done(err);
    if inner.attached.fetch_sub(1, Ordering::SeqCst) == 1 {
        drain_if_empty(inner);
    }
}

/// Once the last attached client is gone, a poisoned sequencer reseeds
/// its vclocks from durable storage and clears the diagnostic, ready to
/// accept fresh connections (§4.2, abort semantics).
fn drain_if_empty(inner: &Arc<SequencerInner>) {
    let mut diag = inner.diag.lock().unwrap();
    if diag.is_some() {
        let durable = inner.storage.durable_vclock();
        *inner.net_vclock.lock().unwrap() = durable.clone();
        *inner.tx_vclock.lock().unwrap() = durable;
        *diag = None;
    }
}

async fn apply_and_commit(inner: &Arc<SequencerInner>, handle: &ClientHandle, tx: PulledTx, prev_lsn: Lsn) {
    loop {
        {
            let txv = inner.tx_vclock.lock().unwrap();
            if txv.get(tx.replica_id) == prev_lsn {
                break;
            }
        }
        if let Some(diag) = inner.diag.lock().unwrap().clone() {
            detach_client(inner, handle, Some(diag));
            return;
        }
        if inner.shutting_down.load(Ordering::Relaxed) {
            detach_client(inner, handle, None);
            return;
        }
        tokio::select! {
            _ = inner.tx_vclock_notify.notified() => {}
            _ = inner.poison_notify.notified() => {}
        }
    }
    if let Some(diag) = inner.diag.lock().unwrap().clone() {
        detach_client(inner, handle, Some(diag));
        return;
    }

    let skip_conflict = inner.skip_conflict.load(Ordering::Relaxed);
    let mut rows = tx.rows;
    for row in rows.iter_mut() {
        if !row.is_dml() {
            continue;
        }
        match inner.storage.apply(row) {
            Ok(()) => {}
            Err(ApplyError::TupleFound) if skip_conflict => {
                let nop = row.clone().into_nop();
                *row = nop;
                if let Err(e) = inner.storage.apply(row) {
                    let err = poison(inner, protocol_err(format!("nop re-apply failed: {e}")));
                    detach_client(inner, handle, Some(err));
                    return;
                }
            }
            Err(e) => {
                let err = poison(inner, LastError { class: ErrorClass::Stopped, message: e.to_string() });
                detach_client(inner, handle, Some(err));
                return;
            }
        }
    }

    if inner.storage.has_local_side_effect() {
        let err = poison(
            inner,
            LastError { class: ErrorClass::Stopped, message: "unsupported: distributed transactions".to_string() },
        );
        detach_client(inner, handle, Some(err));
        return;
    }

    let txn = Transaction { replica_id: tx.replica_id, tsn: tx.lsn, rows: &rows };
    match inner.wal.commit(&txn) {
        Ok(()) => {
            {
                let mut txv = inner.tx_vclock.lock().unwrap();
                txv.follow(tx.replica_id, tx.lsn);
            }
            inner.tx_vclock_notify.notify_waiters();
            let local_vclock = inner.tx_vclock.lock().unwrap().clone();
            let row_timestamp = rows.last().map(|r| r.timestamp).unwrap_or(0.0);
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(row_timestamp);
            handle
                .applier()
                .observe_applied_row(&handle.0.remote_vclock_at_subscribe, &local_vclock, row_timestamp, now);
            handle.wake_writer();
        }
        Err(e) => {
            let err = poison(inner, LastError { class: ErrorClass::Stopped, message: format!("commit failed: {e}") });
            detach_client(inner, handle, Some(err));
        }
    }
}

#[cfg(test)]
mod test;

#[cfg(test)]
mod model;
