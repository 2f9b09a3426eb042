//! The per-applier writer task (§4.3): sends periodic ACKs back to the
//! master peer while the connection is in `Sync` or `Follow`, carrying
//! the process's current committed vclock.
//!
//! On protocol >= 1.7.7 (heartbeats supported) this only wakes when the
//! sequencer actually commits something for this client, via
//! `ClientHandle::writer_notified`. Older peers instead get one ACK per
//! `replication_timeout`, whether or not anything committed, which is
//! why `legacy_timeout` is the thing that decides whether `run_writer_task`
//! ever falls back to a timer.

use std::io::ErrorKind;
use std::time::Duration;

use relay_wire::{payload, Row, RowType};

use crate::applier::{Applier, ApplierState, RowWriter};
use crate::sequencer::{ClientHandle, Sequencer};
use crate::vclock::Vclock;

fn build_ack(vclock: &Vclock) -> relay_wire::Result<Row> {
    Row::control(RowType::Ok).with_body(payload::OkBody {
        vclock: Some(vclock.to_wire()),
        cluster_uuid: None,
        ballot: None,
        replica_id: None,
    })
}

pub async fn run_writer_task(
    applier: Applier,
    mut writer: Box<dyn RowWriter>,
    handle: ClientHandle,
    sequencer: Sequencer,
    legacy_timeout: Option<Duration>,
) {
    loop {
        match legacy_timeout {
            Some(timeout) => {
                tokio::select! {
                    _ = handle.writer_notified() => {}
                    _ = tokio::time::sleep(timeout) => {}
                }
            }
            None => handle.writer_notified().await,
        }

        if handle.is_done() {
            return;
        }

        let state = applier.state();
        if !state.is_ack_eligible() {
            if matches!(state, ApplierState::Off | ApplierState::Stopped) {
                return;
            }
            continue;
        }

        let vclock = sequencer.tx_vclock();
        let ack = match build_ack(&vclock) {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(peer = %applier.peer_uri, error = %e, "failed to encode ack, retrying next wake");
                continue;
            }
        };

        match writer.write_row(&ack).await {
            Ok(()) => {}
            Err(crate::error::ReplicationError::Socket(io_err)) if io_err.kind() == ErrorKind::BrokenPipe => {
                tracing::info!(peer = %applier.peer_uri, "writer task terminating: peer closed the connection");
                return;
            }
            Err(e) => {
                tracing::warn!(peer = %applier.peer_uri, error = %e, "ack write failed, continuing");
            }
        }
    }
}
