use crate::{payload, Ballot, Greeting, ProtocolVersion, ProtocolVersionWire, Row, RowType};
use test_log::test;
use uuid::Uuid;

fn make_pipe() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
    tokio::io::duplex(4096)
}

#[test(tokio::test)]
async fn greeting_round_trips() {
    let (mut a, mut b) = make_pipe();
    let sent = Greeting {
        protocol: "Binary".into(),
        peer_uuid: Uuid::new_v4(),
        version: ProtocolVersionWire::from(ProtocolVersion::new(1, 7, 7)),
        salt: vec![1, 2, 3, 4],
    };
    crate::write_greeting(&mut a, &sent).await.unwrap();
    let got = crate::read_greeting(&mut b).await.unwrap();
    assert_eq!(got.protocol, "Binary");
    assert_eq!(got.salt, sent.salt);
    assert!(got.protocol_version().at_least(1, 7, 0));
}

#[test(tokio::test)]
async fn row_with_body_round_trips() {
    let (mut a, mut b) = make_pipe();
    let req = payload::SubscribeRequest {
        cluster_uuid: Uuid::new_v4(),
        instance_uuid: Uuid::new_v4(),
        vclock: [(1u8, 10i64), (2, 20)].into_iter().collect(),
    };
    let row = Row::control(RowType::Subscribe).with_body(req.clone()).unwrap();
    crate::write_row(&mut a, &row).await.unwrap();
    let got = crate::read_row(&mut b).await.unwrap();
    let decoded: payload::SubscribeRequest = got.decode_body().unwrap();
    assert_eq!(decoded.instance_uuid, req.instance_uuid);
    assert_eq!(decoded.vclock.get(&1), Some(&10));
}

#[test(tokio::test)]
async fn dml_row_into_nop_clears_body() {
    let row = Row {
        replica_id: 3,
        lsn: 42,
        tsn: 42,
        is_commit: true,
        row_type: RowType::Dml,
        timestamp: 1.0,
        body: Some(vec![9, 9, 9]),
    }
    .into_nop();
    assert!(matches!(row.row_type, RowType::Nop));
    assert!(row.body.is_none());
    assert_eq!(row.lsn, 42);
}

#[test(tokio::test)]
async fn oversized_frame_is_rejected() {
    let (mut a, mut b) = make_pipe();
    // Write a bogus length prefix claiming an enormous frame.
    use tokio::io::AsyncWriteExt;
    a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
    let result = crate::read_row(&mut b).await;
    assert!(result.is_err());
}

#[test]
fn ballot_default_is_not_loading() {
    let ballot = Ballot::default();
    assert!(!ballot.is_loading);
}
