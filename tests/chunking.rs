mod common;

use common::{count, errors, session_id, Harness};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether::config::Config;
use tether::messaging::{ChunkStatus, ChunkStore, JsonDecoder};
use tether::session::{ClientMessage, RecoveryClient, ServerEvent};
use tether::time::{Clock, ManualClock};

/// A 100-byte JSON document, ten chunks at 10 bytes each.
fn document() -> (Value, Vec<u8>) {
    let value = json!("r".repeat(98));
    let bytes = serde_json::to_vec(&value).unwrap();
    assert_eq!(bytes.len(), 100);
    (value, bytes)
}

#[tokio::test]
async fn withheld_chunk_is_reported_missing_and_resent_after_resume() {
    let h = Harness::with_defaults();
    let mut client = RecoveryClient::new();
    let id = session_id(&h.connect(&mut client, 1).await);

    let (value, bytes) = document();
    let parts = client.send_chunked("doc-1", &bytes, 10);
    assert_eq!(parts.len(), 10);
    for part in parts {
        if matches!(part, ClientMessage::Chunk { chunk_index: 4, .. }) {
            continue;
        }
        h.send(1, part).await;
    }
    h.send(
        1,
        ClientMessage::ChunkStatusQuery {
            message_id: "doc-1".into(),
        },
    )
    .await;

    let events = h.drain(1);
    assert_eq!(count(&events, |e| matches!(e, ServerEvent::ChunkAck(_))), 9);
    let status = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::ChunkStatus(status) => Some(status.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(status.missing_chunks, vec![4]);
    assert_eq!(status.received_chunks, vec![0, 1, 2, 3, 5, 6, 7, 8, 9]);
    assert!(!status.is_complete);

    h.disconnect(1).await;
    client.on_disconnect();
    let events = h.connect(&mut client, 2).await;

    // Offered during the handshake, before the session is connected again.
    let offered = events
        .iter()
        .position(|e| matches!(e, ServerEvent::ChunkStatus(ChunkStatus { is_complete: false, .. })))
        .expect("incomplete transfer offered");
    let reconnected = events
        .iter()
        .position(|e| matches!(e, ServerEvent::ConnectionState { is_reconnection: true, .. }))
        .expect("reconnected");
    assert!(offered < reconnected);

    let rebuilt = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::MessageReconstructed {
                message_id,
                message,
            } => Some((message_id.clone(), message.clone())),
            _ => None,
        })
        .expect("reconstructed");
    assert_eq!(rebuilt, ("doc-1".to_string(), value));
    assert_eq!(client.pending_uploads(), 0);

    let snapshot = h.coordinator.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.pending_transfers, 0);
    assert_eq!(h.coordinator.metrics().transfers_reconstructed, 1);
}

#[tokio::test]
async fn chunk_errors_are_reported_without_dropping_the_transfer() {
    let h = Harness::with_defaults();
    let mut client = RecoveryClient::new();
    h.connect(&mut client, 1).await;

    let chunk = |index, total| ClientMessage::Chunk {
        message_id: "m".into(),
        chunk_index: index,
        total_chunks: total,
        data: b"{}".to_vec(),
    };
    h.send(1, chunk(0, 3)).await;
    h.send(1, chunk(3, 3)).await;
    h.send(1, chunk(1, 4)).await;
    h.send(
        1,
        ClientMessage::ChunkStatusQuery {
            message_id: "other".into(),
        },
    )
    .await;

    let events = h.drain(1);
    assert_eq!(
        errors(&events),
        vec![
            "InvalidIndex".to_string(),
            "InconsistentTotal".to_string(),
            "UnknownTransfer".to_string(),
        ]
    );
    h.send(
        1,
        ClientMessage::ChunkStatusQuery {
            message_id: "m".into(),
        },
    )
    .await;
    assert!(matches!(
        h.drain(1).as_slice(),
        [ServerEvent::ChunkStatus(ChunkStatus { missing_chunks, .. })] if missing_chunks == &vec![1, 2]
    ));
    assert_eq!(h.coordinator.metrics().validation_errors, 3);
}

#[tokio::test]
async fn undecodable_payload_reports_reconstruction_failure() {
    let h = Harness::with_defaults();
    let mut client = RecoveryClient::new();
    h.connect(&mut client, 1).await;
    for (index, data) in [b"{\"a\"".to_vec(), b":".to_vec()].into_iter().enumerate() {
        h.send(
            1,
            ClientMessage::Chunk {
                message_id: "bad".into(),
                chunk_index: index as u32,
                total_chunks: 2,
                data,
            },
        )
        .await;
    }
    let events = h.drain(1);
    assert_eq!(errors(&events), vec!["ReconstructionFailed".to_string()]);
    assert_eq!(h.coordinator.metrics().reconstruction_failures, 1);
}

#[tokio::test]
async fn idle_transfer_times_out_while_connected() {
    let mut config = Config::default();
    config.chunks.transfer_timeout_ms = 1_000;
    let h = Harness::new(config);
    let mut client = RecoveryClient::new();
    h.connect(&mut client, 1).await;
    let parts = client.send_chunked("slow", b"[1,2,3]", 2);
    h.send(1, parts[0].clone()).await;
    h.drain(1);

    h.advance_and_tick(Duration::from_millis(500)).await;
    assert!(h.drain(1).is_empty());
    h.advance_and_tick(Duration::from_millis(600)).await;
    assert_eq!(errors(&h.drain(1)), vec!["TransferTimeout".to_string()]);
    assert_eq!(h.coordinator.metrics().transfers_timed_out, 1);
}

#[tokio::test]
async fn abandoned_transfer_is_forgotten() {
    let h = Harness::with_defaults();
    let mut client = RecoveryClient::new();
    h.connect(&mut client, 1).await;
    let parts = client.send_chunked("gone", b"[true,false]", 4);
    h.send(1, parts[0].clone()).await;
    h.send(
        1,
        ClientMessage::AbandonTransfer {
            message_id: "gone".into(),
        },
    )
    .await;
    h.send(
        1,
        ClientMessage::ChunkStatusQuery {
            message_id: "gone".into(),
        },
    )
    .await;
    assert_eq!(errors(&h.drain(1)), vec!["UnknownTransfer".to_string()]);
}

#[test]
fn store_tracks_missing_across_out_of_order_delivery() {
    let clock = ManualClock::new();
    let mut store = ChunkStore::new(Config::default().chunks, Arc::new(JsonDecoder));
    let (value, bytes) = document();
    let parts: Vec<&[u8]> = bytes.chunks(10).collect();
    for index in (0..10u32).rev().filter(|i| *i != 4) {
        let receipt = store
            .receive_chunk("doc", index, 10, parts[index as usize].to_vec(), clock.now())
            .unwrap();
        assert!(receipt.reconstruction.is_none());
    }
    assert_eq!(store.query_status("doc").unwrap().missing_chunks, vec![4]);
    let receipt = store
        .receive_chunk("doc", 4, 10, parts[4].to_vec(), clock.now())
        .unwrap();
    assert!(receipt.ack.is_complete);
    assert_eq!(receipt.reconstruction.unwrap().unwrap().message, value);
}
