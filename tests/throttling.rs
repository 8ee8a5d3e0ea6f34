mod common;

use common::{count, errors, messages, session_id, Harness};
use serde_json::json;
use std::time::Duration;
use tether::config::Config;
use tether::session::{RecoveryClient, ServerEvent};

fn throttled(cap: u32, depth: usize) -> Config {
    let mut config = Config::default();
    config.throttle.max_messages_per_window = cap;
    config.throttle.window_ms = 1_000;
    config.throttle.penalty_ms = 1_000;
    config.throttle.max_queue_depth = depth;
    config.throttle.drain_interval_ms = 100;
    config.throttle.drain_batch = 5;
    config
}

fn notifications(events: &[ServerEvent]) -> usize {
    count(events, |e| {
        matches!(e, ServerEvent::ThrottlingNotification { .. })
    })
}

#[tokio::test]
async fn burst_notifies_once_and_drains_everything() {
    let h = Harness::new(throttled(5, 100));
    let mut client = RecoveryClient::new();
    let id = session_id(&h.connect(&mut client, 1).await);

    for n in 0..20 {
        h.publish("all", json!(n)).await;
    }
    let mut events = h.drain(1);
    assert_eq!(messages(&events).len(), 5);
    assert_eq!(notifications(&events), 1);
    assert!(matches!(
        events.iter().find(|e| matches!(e, ServerEvent::ThrottlingNotification { .. })),
        Some(ServerEvent::ThrottlingNotification {
            cap: 5,
            penalty_duration: 1_000,
            ..
        })
    ));

    // More traffic inside the same penalty window stays silent.
    h.advance_and_tick(Duration::from_millis(100)).await;
    for n in 20..23 {
        h.publish("all", json!(n)).await;
    }
    for _ in 0..5 {
        h.advance_and_tick(Duration::from_millis(100)).await;
    }
    events.extend(h.drain(1));
    assert_eq!(notifications(&events), 1);

    let delivered = messages(&events);
    assert_eq!(delivered.len(), 23);
    let payloads: Vec<_> = delivered.iter().map(|(_, _, p)| p.clone()).collect();
    assert_eq!(payloads, (0..23).map(|n| json!(n)).collect::<Vec<_>>());

    let handle = h.coordinator.session(&id).unwrap();
    let session = handle.lock().await;
    let stats = session.throttle.stats();
    assert_eq!(stats.received, 23);
    assert_eq!(
        stats.received,
        stats.sent_immediately + stats.drained + session.throttle.len() as u64
    );
    assert!(session.throttle.is_empty());
}

#[tokio::test]
async fn each_penalty_window_notifies_again() {
    let h = Harness::new(throttled(2, 100));
    let mut client = RecoveryClient::new();
    h.connect(&mut client, 1).await;

    for n in 0..3 {
        h.publish("all", json!(n)).await;
    }
    assert_eq!(notifications(&h.drain(1)), 1);
    h.advance_and_tick(Duration::from_millis(1_500)).await;
    h.drain(1);

    for n in 3..6 {
        h.publish("all", json!(n)).await;
    }
    assert_eq!(notifications(&h.drain(1)), 1);
    assert_eq!(h.coordinator.metrics().throttle_notifications, 2);
}

#[tokio::test]
async fn full_queue_evicts_lowest_priority() {
    let h = Harness::new(throttled(1, 2));
    let mut client = RecoveryClient::new();
    h.connect(&mut client, 1).await;

    h.coordinator.publish("all".into(), json!("m0"), None).await;
    h.coordinator.publish("all".into(), json!("m1"), Some(0)).await;
    h.coordinator.publish("all".into(), json!("m2"), Some(0)).await;
    h.coordinator.publish("all".into(), json!("m3"), Some(5)).await;
    h.coordinator.publish("all".into(), json!("m4"), Some(0)).await;
    h.advance_and_tick(Duration::from_millis(100)).await;

    let events = h.drain(1);
    assert_eq!(
        errors(&events),
        vec!["MessageEvicted".to_string(), "MessageEvicted".to_string()]
    );
    let payloads: Vec<_> = messages(&events).into_iter().map(|(_, _, p)| p).collect();
    assert_eq!(payloads, vec![json!("m0"), json!("m3"), json!("m1")]);
    assert_eq!(h.coordinator.metrics().messages_evicted, 2);
}

#[tokio::test]
async fn queued_messages_survive_a_reconnect() {
    let h = Harness::new(throttled(1, 100));
    let mut client = RecoveryClient::new();
    h.connect(&mut client, 1).await;
    for n in 0..3 {
        h.publish("all", json!(n)).await;
    }
    h.pump(&mut client, 1).await;
    h.disconnect(1).await;
    client.on_disconnect();

    // Frozen while away.
    h.advance_and_tick(Duration::from_millis(500)).await;
    h.publish("all", json!("while away")).await;

    let mut events = h.connect(&mut client, 2).await;
    h.advance_and_tick(Duration::from_millis(100)).await;
    events.extend(h.pump(&mut client, 2).await);

    let payloads: Vec<_> = messages(&events).into_iter().map(|(_, _, p)| p).collect();
    assert_eq!(payloads, vec![json!(1), json!(2), json!("while away")]);
    let sequences: Vec<_> = client.delivered().iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn sustained_overload_starts_a_new_penalty_each_time_one_lapses() {
    let h = Harness::new(throttled(5, 100));
    let mut client = RecoveryClient::new();
    let id = session_id(&h.connect(&mut client, 1).await);

    // 20 messages a second for five seconds against a cap of 5.
    let mut events = Vec::new();
    for step in 0..50 {
        h.publish("all", json!(step * 2)).await;
        h.publish("all", json!(step * 2 + 1)).await;
        h.advance_and_tick(Duration::from_millis(100)).await;
        events.extend(h.drain(1));
    }
    assert_eq!(notifications(&events), 4);
    assert_eq!(h.coordinator.metrics().throttle_notifications, 4);

    for _ in 0..10 {
        h.advance_and_tick(Duration::from_millis(100)).await;
    }
    events.extend(h.drain(1));
    let payloads: Vec<_> = messages(&events).into_iter().map(|(_, _, p)| p).collect();
    assert_eq!(payloads, (0..100).map(|n| json!(n)).collect::<Vec<_>>());

    let handle = h.coordinator.session(&id).unwrap();
    let session = handle.lock().await;
    let stats = session.throttle.stats();
    assert_eq!(stats.received, stats.sent_immediately + stats.drained);
    assert_eq!(stats.notifications, 4);
}
